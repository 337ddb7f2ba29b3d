//! Concurrent content digests for every eligible file below a root.
//!
//! Traversal runs on one blocking thread and feeds paths through a bounded
//! queue to a fixed set of hashing workers. Every worker owns a clone of the
//! record sender, so the record stream closes only once the traversal and all
//! in-flight hashes are done, including after cancellation.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use walkdir::WalkDir;

use super::builder::is_partial_copy;
use super::error::{SyncError, SyncResult};
use crate::utils::config::Config;
use crate::utils::disk::ByteSize;

pub type Digest = blake3::Hash;

/// One regular file visited by a walk.
#[derive(Debug)]
pub struct DigestRecord {
    pub path: PathBuf,
    pub digest: io::Result<Digest>,
}

/// Which entries a walk may visit
#[derive(Debug, Clone, Default)]
pub struct WalkFilter {
    ignored_extensions: Vec<String>,
    skip_hidden: bool,
    max_size: Option<u64>,
}

impl WalkFilter {
    /// Backup store walks only drop ignored extensions
    pub fn backup(config: &Config) -> Self {
        Self {
            ignored_extensions: normalize_extensions(&config.ignored_extensions),
            skip_hidden: false,
            max_size: None,
        }
    }

    /// Source walks also drop hidden entries and oversized files
    pub fn source(config: &Config) -> Self {
        Self {
            ignored_extensions: normalize_extensions(&config.ignored_extensions),
            skip_hidden: true,
            max_size: config.max_file_size(),
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self
                .ignored_extensions
                .iter()
                .any(|ignored| ignored.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    /// Name-only checks (extension, hidden) for a path relative to its root.
    /// Size is not considered.
    pub fn admits(&self, relative: &Path) -> bool {
        !(self.is_ignored(relative) || (self.skip_hidden && is_hidden(relative)))
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_string())
        .filter(|e| !e.is_empty())
        .collect()
}

/// True when any component of a root-relative path starts with a dot
pub fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// BLAKE3 digest of the file at `path`, read in streaming fashion
pub fn hash_file(path: &Path) -> io::Result<Digest> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize())
}

/// A running walk. Drain [`DigestWalk::records`], then call
/// [`DigestWalk::finish`] for the top-level outcome.
pub struct DigestWalk {
    root: PathBuf,
    records: ReceiverStream<DigestRecord>,
    traversal: JoinHandle<SyncResult<u64>>,
}

impl DigestWalk {
    pub fn spawn(
        root: PathBuf,
        filter: WalkFilter,
        workers: usize,
        buffer: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (records_tx, records_rx) = mpsc::channel(buffer.max(1));
        let (paths_tx, paths_rx) = bounded::<PathBuf>(buffer.max(1));

        for worker_id in 0..workers.max(1) {
            let paths_rx = paths_rx.clone();
            let records_tx = records_tx.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                hash_worker(worker_id, paths_rx, records_tx, cancel)
            });
        }
        drop(paths_rx);

        let walk_root = root.clone();
        let traversal = tokio::task::spawn_blocking(move || {
            traverse(&walk_root, &filter, paths_tx, records_tx, &cancel)
        });

        Self {
            root,
            records: ReceiverStream::new(records_rx),
            traversal,
        }
    }

    /// Unordered records; the stream ends once every hash has completed
    pub fn records(&mut self) -> &mut ReceiverStream<DigestRecord> {
        &mut self.records
    }

    /// Drain whatever is left, then report the traversal outcome: the number
    /// of files queued for hashing, or the one fatal walk error.
    pub async fn finish(mut self) -> SyncResult<u64> {
        let mut dropped = 0usize;
        while self.records.next().await.is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(root = %self.root.display(), dropped, "discarded undrained digest records");
        }
        self.traversal.await?
    }
}

fn hash_worker(
    worker_id: usize,
    paths: Receiver<PathBuf>,
    records: mpsc::Sender<DigestRecord>,
    cancel: CancellationToken,
) {
    for path in paths.iter() {
        if cancel.is_cancelled() {
            debug!(worker_id, "hash worker cancelled");
            break;
        }
        let digest = hash_file(&path);
        if records.blocking_send(DigestRecord { path, digest }).is_err() {
            break;
        }
    }
}

fn traverse(
    root: &Path,
    filter: &WalkFilter,
    paths: Sender<PathBuf>,
    records: mpsc::Sender<DigestRecord>,
    cancel: &CancellationToken,
) -> SyncResult<u64> {
    let mut walker = WalkDir::new(root).follow_links(false).into_iter();
    let mut queued = 0u64;

    loop {
        // Abort the traversal if shutdown was requested
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled(root.to_path_buf()));
        }

        let entry = match walker.next() {
            None => break,
            Some(Ok(entry)) => entry,
            Some(Err(err)) => {
                if err.depth() == 0 {
                    return Err(SyncError::Walk {
                        root: root.to_path_buf(),
                        source: err,
                    });
                }
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                let io_err = match err.io_error() {
                    Some(e) => io::Error::new(e.kind(), err.to_string()),
                    None => io::Error::new(io::ErrorKind::Other, err.to_string()),
                };
                if records
                    .blocking_send(DigestRecord {
                        path,
                        digest: Err(io_err),
                    })
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());

        if entry.file_type().is_dir() {
            if entry.depth() > 0 && filter.skip_hidden && is_hidden(relative) {
                walker.skip_current_dir();
            }
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        if filter.is_ignored(entry.path()) || is_partial_copy(entry.path()) {
            continue;
        }

        if filter.skip_hidden && is_hidden(relative) {
            continue;
        }

        if let Some(max_size) = filter.max_size {
            match entry.metadata() {
                Ok(metadata) if metadata.len() >= max_size => {
                    error!(
                        path = %entry.path().display(),
                        size = %ByteSize(metadata.len()),
                        max = %ByteSize(max_size),
                        "file exceeds size limit"
                    );
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    let digest = Err(io::Error::new(io::ErrorKind::Other, err.to_string()));
                    if records
                        .blocking_send(DigestRecord {
                            path: entry.into_path(),
                            digest,
                        })
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            }
        }

        if paths.send(entry.into_path()).is_err() {
            // every hash worker is gone
            break;
        }
        queued += 1;
    }

    Ok(queued)
}
