use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::classify::Interlace;
use super::error::{SyncError, SyncResult};

/// External image encoder, consumed as a black box.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Current encoding quality (0-100) of the image at `path`
    async fn quality(&self, path: &Path) -> SyncResult<u8>;

    /// Re-encode `path` in place at `quality`
    async fn reencode(&self, path: &Path, quality: u8, interlace: Interlace) -> SyncResult<()>;
}

/// ImageMagick `identify` / `convert` invoked as subprocesses
#[derive(Debug, Clone)]
pub struct ImageMagick {
    identify: PathBuf,
    convert: PathBuf,
}

impl Default for ImageMagick {
    fn default() -> Self {
        Self {
            identify: PathBuf::from("identify"),
            convert: PathBuf::from("convert"),
        }
    }
}

impl ImageMagick {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version line of `convert`, or an error when ImageMagick is not installed
    pub async fn check_available(&self) -> SyncResult<String> {
        let output = Command::new(&self.convert).arg("-version").output().await?;
        if !output.status.success() {
            return Err(SyncError::Transcode {
                path: self.convert.clone(),
                message: "convert -version failed".to_string(),
            });
        }
        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

#[async_trait]
impl Transcoder for ImageMagick {
    async fn quality(&self, path: &Path) -> SyncResult<u8> {
        let output = Command::new(&self.identify)
            .args(["-format", "%Q\n"])
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(SyncError::Transcode {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // multi-frame images report one line per frame
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_quality(&stdout).ok_or_else(|| SyncError::Transcode {
            path: path.to_path_buf(),
            message: format!("unreadable quality {:?}", stdout.trim()),
        })
    }

    async fn reencode(&self, path: &Path, quality: u8, interlace: Interlace) -> SyncResult<()> {
        let mut cmd = Command::new(&self.convert);
        cmd.arg(path)
            .args(["-sampling-factor", "4:2:0", "-strip"])
            .arg("-quality")
            .arg(quality.to_string())
            .arg("-interlace")
            .arg(interlace.as_str())
            .args(["-colorspace", "sRGB"])
            .arg(path);

        debug!("Running convert command: {:?}", cmd);
        let output = cmd.output().await?;

        if !output.status.success() {
            return Err(SyncError::Transcode {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn parse_quality(stdout: &str) -> Option<u8> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<u8>().ok())
        .filter(|q| *q <= 100)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quality() {
        assert_eq!(parse_quality("92\n"), Some(92));
        assert_eq!(parse_quality("\n85\n85\n"), Some(85));
        assert_eq!(parse_quality("abc"), None);
        assert_eq!(parse_quality("250"), None);
        assert_eq!(parse_quality(""), None);
    }
}
