//! The file materializer: the one place where a source file becomes a backup
//! copy, whichever trigger (live event or reconciliation) asked for it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::classify::{FileKind, Interlace};
use super::context::Context;
use super::error::{SyncError, SyncResult};
use super::transcode::Transcoder;
use super::{SubPath, WatchedRoot, STATIC_BACKUP_FOLDER};
use crate::utils::disk::ByteSize;

/// Extension of the hidden temp files a copy streams into before the rename
pub const PARTIAL_EXTENSION: &str = "partial";

/// Leftover temp file from an interrupted copy
pub fn is_partial_copy(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false);
    hidden && path.extension().map(|e| e == PARTIAL_EXTENSION).unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressOutcome {
    AlreadyCompressed { quality: u8 },
    Compressed { from: u8, to: u8 },
}

#[derive(Clone)]
pub struct Builder {
    ctx: Context,
    transcoder: Arc<dyn Transcoder>,
}

impl Builder {
    pub fn new(ctx: Context, transcoder: Arc<dyn Transcoder>) -> Self {
        Self { ctx, transcoder }
    }

    /// `<backup_root>/backup_test`
    pub fn backup_dir(&self) -> PathBuf {
        self.ctx
            .settings()
            .config
            .backup_root
            .join(STATIC_BACKUP_FOLDER)
    }

    /// Mirrored directory for `sub_path`, without touching the filesystem
    pub fn destination_dir(&self, root: &WatchedRoot, sub_path: &SubPath) -> PathBuf {
        let settings = self.ctx.settings();
        let mut dir = settings.config.backup_root.join(STATIC_BACKUP_FOLDER);
        if settings.config.nest_root_name {
            if let Some(name) = root.basename() {
                dir.push(name);
            }
        }
        dir.join(&sub_path.relative_dir)
    }

    /// Mirrored directory for `sub_path`, created if missing
    pub async fn resolve_destination_dir(
        &self,
        root: &WatchedRoot,
        sub_path: &SubPath,
    ) -> SyncResult<PathBuf> {
        let dir = self.destination_dir(root, sub_path);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| SyncError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        Ok(dir)
    }

    /// Stream `src` into `dst` through a temp file that is renamed into place,
    /// so readers never see a truncated destination. Returns bytes copied.
    pub async fn copy(&self, src: &Path, dst: &Path) -> SyncResult<u64> {
        let metadata = fs::symlink_metadata(src).await?;
        if !metadata.file_type().is_file() {
            return Err(SyncError::NotRegularFile(src.to_path_buf()));
        }

        let name = dst
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = dst.with_file_name(format!(
            ".{}.{}.{}",
            name,
            uuid::Uuid::new_v4().simple(),
            PARTIAL_EXTENSION
        ));

        let result: std::io::Result<u64> = async {
            let mut from = File::open(src).await?;
            let mut to = File::create(&temp).await?;
            let bytes = tokio::io::copy(&mut from, &mut to).await?;
            to.flush().await?;
            to.sync_data().await?;
            drop(to);
            fs::rename(&temp, dst).await?;
            Ok(bytes)
        }
        .await;

        match result {
            Ok(bytes) => Ok(bytes),
            Err(source) => {
                // best effort; a stale temp file is skipped by every walk
                let _ = fs::remove_file(&temp).await;
                Err(SyncError::Copy {
                    from: src.to_path_buf(),
                    to: dst.to_path_buf(),
                    source,
                })
            }
        }
    }

    /// Re-encode `path` in place unless it is already at or below `quality`
    pub async fn compress(
        &self,
        quality: u8,
        path: &Path,
        interlace: Interlace,
    ) -> SyncResult<CompressOutcome> {
        let current = self.transcoder.quality(path).await?;
        if current <= quality {
            debug!(path = %path.display(), current, "File already compressed");
            return Ok(CompressOutcome::AlreadyCompressed { quality: current });
        }

        let size_before = fs::metadata(path).await?.len();
        self.transcoder.reencode(path, quality, interlace).await?;
        let size_after = fs::metadata(path)
            .await
            .map(|m| m.len())
            .unwrap_or(size_before);

        info!(
            path = %path.display(),
            before = %ByteSize(size_before),
            after = %ByteSize(size_after),
            "Compress file is done"
        );
        Ok(CompressOutcome::Compressed {
            from: current,
            to: quality,
        })
    }

    /// Copy `path` into its mirrored location and, for images with compression
    /// enabled, transcode the copy. Returns the destination file.
    ///
    /// Transcoder failures are logged and leave the plain copy in place.
    pub async fn materialize(
        &self,
        root: &WatchedRoot,
        path: &Path,
        kind: FileKind,
    ) -> SyncResult<PathBuf> {
        let sub_path = root
            .relativize(path)
            .ok_or_else(|| SyncError::OutsideRoots(path.to_path_buf()))?;

        let dir = self.resolve_destination_dir(root, &sub_path).await?;
        let dst = dir.join(&sub_path.file_name);
        let bytes = self.copy(path, &dst).await?;
        info!(
            file = %sub_path.file_name.to_string_lossy(),
            dst = %dst.display(),
            size = %ByteSize(bytes),
            "Copied file into backup"
        );

        if let FileKind::Image(interlace) = kind {
            let compress = self.ctx.settings().config.compress.clone();
            if compress.enabled {
                if let Err(e) = self.compress(compress.quality, &dst, interlace).await {
                    warn!(path = %dst.display(), error = %e, "Compress image error, keeping copy as is");
                }
            }
        }

        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::transcode::fake::FakeTranscoder;
    use crate::utils::config::{CompressConfig, Config};
    use std::fs as stdfs;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: WatchedRoot,
        backup_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        stdfs::create_dir_all(src.join("a")).unwrap();
        Fixture {
            root: WatchedRoot::resolve(0, &src).unwrap(),
            backup_root: stdfs::canonicalize(dir.path()).unwrap().join("drive"),
            _dir: dir,
        }
    }

    fn config(fx: &Fixture, compress: bool, nest: bool) -> Config {
        Config {
            paths: vec![fx.root.path.clone()],
            backup_root: fx.backup_root.clone(),
            workers: 2,
            nest_root_name: nest,
            compress: CompressConfig {
                enabled: compress,
                quality: 80,
                ..CompressConfig::default()
            },
            ..Config::default()
        }
    }

    fn builder(config: Config, transcoder: Arc<FakeTranscoder>) -> Builder {
        Builder::new(Context::for_tests(config), transcoder)
    }

    #[tokio::test]
    async fn test_materialize_is_idempotent() {
        let fx = fixture();
        let src = fx.root.path.join("a/notes.txt");
        stdfs::write(&src, b"hello backup").unwrap();
        let b = builder(config(&fx, false, false), Arc::new(FakeTranscoder::new(100)));

        let first = b.materialize(&fx.root, &src, FileKind::Generic).await.unwrap();
        let second = b.materialize(&fx.root, &src, FileKind::Generic).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, fx.backup_root.join("backup_test/a/notes.txt"));
        assert_eq!(stdfs::read(&first).unwrap(), b"hello backup");
        // no temp files left behind
        let entries: Vec<_> = stdfs::read_dir(first.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_nest_root_name_in_destination() {
        let fx = fixture();
        let b = builder(config(&fx, false, true), Arc::new(FakeTranscoder::new(100)));
        let sub = fx.root.relativize(&fx.root.path.join("a/b/c.txt")).unwrap();
        assert_eq!(
            b.destination_dir(&fx.root, &sub),
            fx.backup_root.join("backup_test/src/a/b")
        );
    }

    #[tokio::test]
    async fn test_resolve_destination_dir_failure() {
        let fx = fixture();
        // a plain file where the backup root should be
        stdfs::write(&fx.backup_root, b"not a directory").unwrap();
        let b = builder(config(&fx, false, false), Arc::new(FakeTranscoder::new(100)));
        let sub = fx.root.relativize(&fx.root.path.join("a/x.txt")).unwrap();
        let err = b.resolve_destination_dir(&fx.root, &sub).await.unwrap_err();
        assert!(matches!(err, SyncError::CreateDir { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_rejects_symlink() {
        let fx = fixture();
        let target = fx.root.path.join("a/real.txt");
        let link = fx.root.path.join("a/link.txt");
        stdfs::write(&target, b"x").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let b = builder(config(&fx, false, false), Arc::new(FakeTranscoder::new(100)));

        let err = b
            .copy(&link, &fx.backup_root.join("link.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotRegularFile(_)));
    }

    #[tokio::test]
    async fn test_image_is_compressed_to_target() {
        let fx = fixture();
        let src = fx.root.path.join("a/photo.jpg");
        stdfs::write(&src, b"jpeg bytes").unwrap();
        let transcoder = Arc::new(FakeTranscoder::new(95));
        let b = builder(config(&fx, true, false), transcoder.clone());

        let dst = b
            .materialize(&fx.root, &src, FileKind::Image(Interlace::Jpeg))
            .await
            .unwrap();

        assert_eq!(transcoder.reencode_count(), 1);
        assert!(transcoder.quality(&dst).await.unwrap() <= 80);
        let calls = transcoder.reencodes.lock();
        assert_eq!(calls[0], (dst.clone(), 80, Interlace::Jpeg));
    }

    #[tokio::test]
    async fn test_already_compressed_image_untouched() {
        let fx = fixture();
        let src = fx.root.path.join("a/photo.png");
        stdfs::write(&src, b"png bytes").unwrap();
        let transcoder = Arc::new(FakeTranscoder::new(80));
        let b = builder(config(&fx, true, false), transcoder.clone());

        let dst = b
            .materialize(&fx.root, &src, FileKind::Image(Interlace::Png))
            .await
            .unwrap();
        assert_eq!(transcoder.reencode_count(), 0);
        assert_eq!(
            b.compress(80, &dst, Interlace::Png).await.unwrap(),
            CompressOutcome::AlreadyCompressed { quality: 80 }
        );
    }

    #[tokio::test]
    async fn test_transcoder_failure_keeps_copy() {
        let fx = fixture();
        let src = fx.root.path.join("a/photo.jpg");
        stdfs::write(&src, b"jpeg bytes").unwrap();
        let b = builder(config(&fx, true, false), Arc::new(FakeTranscoder::failing()));

        let dst = b
            .materialize(&fx.root, &src, FileKind::Image(Interlace::Jpeg))
            .await
            .unwrap();
        assert_eq!(stdfs::read(dst).unwrap(), b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_generic_files_and_disabled_compression_skip_transcoder() {
        let fx = fixture();
        let src = fx.root.path.join("a/photo.jpg");
        stdfs::write(&src, b"jpeg bytes").unwrap();
        let transcoder = Arc::new(FakeTranscoder::new(95));

        let disabled = builder(config(&fx, false, false), transcoder.clone());
        disabled
            .materialize(&fx.root, &src, FileKind::Image(Interlace::Jpeg))
            .await
            .unwrap();

        let enabled = builder(config(&fx, true, false), transcoder.clone());
        enabled
            .materialize(&fx.root, &src, FileKind::Generic)
            .await
            .unwrap();

        assert_eq!(transcoder.reencode_count(), 0);
    }

    #[test]
    fn test_is_partial_copy() {
        assert!(is_partial_copy(Path::new("/b/.photo.jpg.0a1b.partial")));
        assert!(!is_partial_copy(Path::new("/b/photo.partial")));
        assert!(!is_partial_copy(Path::new("/b/.photo.jpg")));
    }
}
