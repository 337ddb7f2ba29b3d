//! Periodic full reconciliation of every watched root against the backup store.
//!
//! Live notifications can be missed (process down, queue full at shutdown,
//! directories not registered yet). The janitor closes those gaps: it indexes
//! the backup store by content, walks each root, and materializes whatever
//! content the store does not hold yet.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use super::builder::Builder;
use super::context::{Context, Settings};
use super::digest::{DigestRecord, DigestWalk, WalkFilter};
use super::error::SyncResult;
use super::index::BackupIndex;
use super::WatchedRoot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Copied,
    KnownDigest,
    Guarded,
    Failed,
}

/// Summary of one reconciliation pass over one root
#[derive(Debug, Clone)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub seen: u64,
    pub copied: u64,
    pub skipped_digest: u64,
    pub skipped_guard: u64,
    pub failed: u64,
    pub duration: Duration,
}

impl PassReport {
    fn new(root: &Path) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            root: root.to_path_buf(),
            started_at: Utc::now(),
            seen: 0,
            copied: 0,
            skipped_digest: 0,
            skipped_guard: 0,
            failed: 0,
            duration: Duration::ZERO,
        }
    }

    fn tally(&mut self, outcome: FileOutcome) {
        self.seen += 1;
        match outcome {
            FileOutcome::Copied => self.copied += 1,
            FileOutcome::KnownDigest => self.skipped_digest += 1,
            FileOutcome::Guarded => self.skipped_guard += 1,
            FileOutcome::Failed => self.failed += 1,
        }
    }
}

/// Delay before the next pass: slow scans earn proportionally longer rests
pub fn next_delay(elapsed: Duration, base: Duration) -> Duration {
    elapsed + base
}

pub struct Janitor {
    ctx: Context,
    roots: Arc<[WatchedRoot]>,
    builder: Builder,
}

impl Janitor {
    pub fn new(ctx: Context, roots: Arc<[WatchedRoot]>, builder: Builder) -> Self {
        Self {
            ctx,
            roots,
            builder,
        }
    }

    /// Initial full scan, then one pass every (last pass duration + interval)
    /// until shutdown. Passes never overlap.
    pub async fn run(self) {
        info!(roots = self.roots.len(), "Janitor started");
        loop {
            let elapsed = self.sync_all().await;
            if self.ctx.is_cancelled() {
                break;
            }

            let base = self.ctx.settings().config.janitor_interval;
            let delay = next_delay(elapsed, base);
            info!(
                duration = %humantime::format_duration(Duration::from_secs(elapsed.as_secs())),
                next_in = %humantime::format_duration(Duration::from_secs(delay.as_secs())),
                "scanning complete"
            );

            tokio::select! {
                _ = self.ctx.cancel_token().cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("Janitor stopped");
    }

    /// One pass over every root; a failing root does not stop the others.
    /// Returns the time spent.
    pub async fn sync_all(&self) -> Duration {
        let start = Instant::now();
        for root in self.roots.iter() {
            if self.ctx.is_cancelled() {
                break;
            }
            match self.run_pass(root).await {
                Ok(report) => info!(
                    pass_id = %report.pass_id,
                    root = %report.root.display(),
                    started_at = %report.started_at.to_rfc3339(),
                    seen = report.seen,
                    copied = report.copied,
                    skipped_digest = report.skipped_digest,
                    skipped_guard = report.skipped_guard,
                    failed = report.failed,
                    duration_ms = report.duration.as_millis() as u64,
                    "Reconciliation pass finished"
                ),
                Err(e) => error!(root = %root.path.display(), error = %e, "Reconciliation pass aborted"),
            }
        }
        start.elapsed()
    }

    /// Index the backup store, then walk `root` and materialize every file
    /// whose content the store lacks.
    pub async fn run_pass(&self, root: &WatchedRoot) -> SyncResult<PassReport> {
        let mut report = PassReport::new(&root.path);
        let span = info_span!("janitor_pass", pass_id = %report.pass_id, root = %root.path.display());

        async move {
            let start = Instant::now();
            let settings = self.ctx.settings();
            let config = &settings.config;
            let cancel = self.ctx.cancel_token().clone();

            // Hard barrier: no lookup happens before the index is complete
            let index = BackupIndex::build(
                &self.builder.backup_dir(),
                WalkFilter::backup(config),
                config.workers,
                config.walk_buffer,
                cancel.clone(),
            )
            .await?;
            debug!(entries = index.len(), "backup index ready");

            let mut walk = DigestWalk::spawn(
                root.path.clone(),
                WalkFilter::source(config),
                config.workers,
                config.walk_buffer,
                cancel,
            );

            {
                let mut outcomes = walk
                    .records()
                    .map(|record| self.reconcile_file(root, &index, &settings, record))
                    .buffer_unordered(config.workers.max(1));
                while let Some(outcome) = outcomes.next().await {
                    report.tally(outcome);
                }
            }

            walk.finish().await?;
            report.duration = start.elapsed();
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn reconcile_file(
        &self,
        root: &WatchedRoot,
        index: &BackupIndex,
        settings: &Settings,
        record: DigestRecord,
    ) -> FileOutcome {
        let digest = match record.digest {
            Ok(digest) => digest,
            Err(e) => {
                error!(path = %record.path.display(), error = %e, "local drive");
                return FileOutcome::Failed;
            }
        };

        if let Some(backup) = index.get(&digest) {
            debug!(path = %record.path.display(), backup = %backup.display(), "content already backed up");
            return FileOutcome::KnownDigest;
        }

        let Some(sub_path) = root.relativize(&record.path) else {
            error!(path = %record.path.display(), "walked file outside its root");
            return FileOutcome::Failed;
        };

        if settings.config.name_guard && index.has_file_named(&sub_path.file_name) {
            debug!(path = %record.path.display(), "backup with the same name exists, skipping");
            return FileOutcome::Guarded;
        }

        let destination = self
            .builder
            .destination_dir(root, &sub_path)
            .join(&sub_path.file_name);
        if destination_is_current(&record.path, &destination).await {
            debug!(path = %record.path.display(), "backup copy is newer than source, skipping");
            return FileOutcome::Guarded;
        }

        let kind = settings.classifier.classify(&record.path);
        match self.builder.materialize(root, &record.path, kind).await {
            Ok(_) => FileOutcome::Copied,
            Err(e) => {
                error!(path = %record.path.display(), error = %e, "materialize failed");
                FileOutcome::Failed
            }
        }
    }
}

/// The mirrored copy exists and was written no earlier than the source was
/// last modified. Transcoded copies differ in content, so the digest alone
/// would re-ingest them on every pass.
async fn destination_is_current(source: &Path, destination: &Path) -> bool {
    let (Ok(src), Ok(dst)) = (
        tokio::fs::metadata(source).await,
        tokio::fs::metadata(destination).await,
    ) else {
        return false;
    };
    match (src.modified(), dst.modified()) {
        (Ok(src_time), Ok(dst_time)) => dst.is_file() && dst_time >= src_time,
        _ => false,
    }
}
