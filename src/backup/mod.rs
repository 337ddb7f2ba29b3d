pub mod builder;
pub mod classify;
pub mod context;
pub mod digest;
pub mod dispatcher;
pub mod error;
pub mod index;
pub mod janitor;
pub mod transcode;
pub mod watcher;

pub use builder::Builder;
pub use classify::{Classifier, FileKind, Interlace};
pub use context::{Context, Settings};
pub use digest::{DigestRecord, DigestWalk, WalkFilter};
pub use dispatcher::Dispatcher;
pub use error::{SyncError, SyncResult};
pub use index::BackupIndex;
pub use janitor::Janitor;
pub use transcode::{ImageMagick, Transcoder};
pub use watcher::{LiveWatcher, Subscription};

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Folder under the backup root that holds the mirrored trees
pub const STATIC_BACKUP_FOLDER: &str = "backup_test";

/// "This path was created or written." Consumers re-stat to learn the rest.
pub type Event = PathBuf;

/// A configured source tree, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedRoot {
    pub index: usize,
    pub path: PathBuf,
}

/// A file's position below its watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubPath {
    /// Directory relative to the root; empty for files directly in the root
    pub relative_dir: PathBuf,
    pub file_name: OsString,
}

impl WatchedRoot {
    /// Resolve a configured path to its absolute, canonical form
    pub fn resolve(index: usize, path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            index,
            path: std::fs::canonicalize(path)?,
        })
    }

    pub fn basename(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path) && path != self.path
    }

    /// Split `path` into the directory below this root and the file name.
    /// `None` when the path is not strictly below the root.
    pub fn relativize(&self, path: &Path) -> Option<SubPath> {
        let relative = path.strip_prefix(&self.path).ok()?;
        let file_name = relative.file_name()?.to_os_string();
        let relative_dir = relative
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Some(SubPath {
            relative_dir,
            file_name,
        })
    }
}

/// The most specific root containing `path`
pub fn owning_root<'a>(roots: &'a [WatchedRoot], path: &Path) -> Option<&'a WatchedRoot> {
    roots
        .iter()
        .filter(|root| root.contains(path))
        .max_by_key(|root| root.path.components().count())
}
