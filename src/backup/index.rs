use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::digest::{Digest, DigestWalk, WalkFilter};
use super::error::{SyncError, SyncResult};

/// Digest → backup path for everything currently in the backup store.
/// Rebuilt from scratch for every reconciliation pass.
#[derive(Debug, Default)]
pub struct BackupIndex {
    by_digest: HashMap<Digest, PathBuf>,
    names: HashMap<OsString, usize>,
}

impl BackupIndex {
    /// Walk `backup_dir` (creating it if needed) and fold every good record
    /// into the index. Only returns once the walk's record stream has closed;
    /// a fatal walk error means the index cannot be trusted.
    pub async fn build(
        backup_dir: &Path,
        filter: WalkFilter,
        workers: usize,
        buffer: usize,
        cancel: CancellationToken,
    ) -> SyncResult<Self> {
        tokio::fs::create_dir_all(backup_dir)
            .await
            .map_err(|source| SyncError::CreateDir {
                path: backup_dir.to_path_buf(),
                source,
            })?;

        let mut walk = DigestWalk::spawn(backup_dir.to_path_buf(), filter, workers, buffer, cancel);
        let mut index = Self::default();

        while let Some(record) = walk.records().next().await {
            match record.digest {
                Ok(digest) => index.insert(digest, record.path),
                Err(e) => error!(path = %record.path.display(), error = %e, "hard drive"),
            }
        }

        walk.finish().await?;
        debug!(backup_dir = %backup_dir.display(), entries = index.len(), "backup index built");
        Ok(index)
    }

    /// Last writer wins when two backup files share a digest
    pub fn insert(&mut self, digest: Digest, path: PathBuf) {
        let name = path.file_name().map(OsStr::to_os_string);
        if let Some(previous) = self.by_digest.insert(digest, path) {
            if let Some(old_name) = previous.file_name() {
                if let Some(count) = self.names.get_mut(old_name) {
                    *count -= 1;
                    if *count == 0 {
                        self.names.remove(old_name);
                    }
                }
            }
        }
        if let Some(name) = name {
            *self.names.entry(name).or_insert(0) += 1;
        }
    }

    /// Backup copy already holding this content, if any
    pub fn get(&self, digest: &Digest) -> Option<&Path> {
        self.by_digest.get(digest).map(PathBuf::as_path)
    }

    /// Any indexed backup file called `name`, in any directory
    pub fn has_file_named(&self, name: &OsStr) -> bool {
        self.names.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::Config;
    use std::fs;

    #[tokio::test]
    async fn test_identical_content_collapses_to_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("backup_test");
        fs::create_dir_all(backup.join("x")).unwrap();
        fs::write(backup.join("x/a.txt"), b"dup").unwrap();
        fs::write(backup.join("b.txt"), b"dup").unwrap();
        fs::write(backup.join("c.txt"), b"unique").unwrap();

        let index = BackupIndex::build(
            &backup,
            WalkFilter::backup(&Config::default()),
            2,
            8,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.get(&blake3::hash(b"dup")).is_some());
        assert!(index.get(&blake3::hash(b"unique")).is_some());
        assert!(index.get(&blake3::hash(b"absent")).is_none());
    }

    #[tokio::test]
    async fn test_missing_backup_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("drive/backup_test");

        let index = BackupIndex::build(
            &backup,
            WalkFilter::backup(&Config::default()),
            1,
            1,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(index.is_empty());
        assert!(backup.is_dir());
    }

    #[tokio::test]
    async fn test_cancelled_build_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = BackupIndex::build(
            dir.path(),
            WalkFilter::backup(&Config::default()),
            1,
            1,
            cancel,
        )
        .await;
        assert!(matches!(result, Err(SyncError::Cancelled(_))));
    }

    #[test]
    fn test_names_follow_last_writer() {
        let mut index = BackupIndex::default();
        let digest = blake3::hash(b"same");
        index.insert(digest, PathBuf::from("/b/old.txt"));
        assert!(index.has_file_named(OsStr::new("old.txt")));

        index.insert(digest, PathBuf::from("/b/new.txt"));
        assert_eq!(index.get(&digest), Some(Path::new("/b/new.txt")));
        assert!(!index.has_file_named(OsStr::new("old.txt")));
        assert!(index.has_file_named(OsStr::new("new.txt")));
    }
}
