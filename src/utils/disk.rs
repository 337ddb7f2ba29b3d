use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use tokio::fs;

const KB: f64 = 1024.0;
const MB: f64 = KB * 1024.0;
const GB: f64 = MB * 1024.0;

/// Byte count rendered as B/KB/MB/GB with two decimals
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0 as f64;
        if b >= GB {
            write!(f, "{:.2}GB", b / GB)
        } else if b >= MB {
            write!(f, "{:.2}MB", b / MB)
        } else if b >= KB {
            write!(f, "{:.2}KB", b / KB)
        } else {
            write!(f, "{:.2}B", b)
        }
    }
}

/// Make sure the backup root is a writable directory, creating it if needed.
///
/// A removable drive that is not mounted yet shows up here as a failure; the
/// caller decides whether that is fatal.
pub async fn verify_backup_root(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("creating backup root {}", path.display()))?;

    let metadata = fs::metadata(path).await?;
    if !metadata.is_dir() {
        anyhow::bail!("backup root {} is not a directory", path.display());
    }

    // Probe writability the same way a copy would
    let probe = path.join(format!(".backup-watch-probe-{}", uuid::Uuid::new_v4()));
    fs::write(&probe, b"")
        .await
        .with_context(|| format!("backup root {} is not writable", path.display()))?;
    let _ = fs::remove_file(&probe).await;

    Ok(())
}
