use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} is not a regular file")]
    NotRegularFile(PathBuf),

    #[error("{0} is not under any watched root")]
    OutsideRoots(PathBuf),

    #[error("creating folder {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("copying {from} into {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder failed on {path}: {message}")]
    Transcode { path: PathBuf, message: String },

    #[error("walk of {0} cancelled")]
    Cancelled(PathBuf),

    #[error("walking {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("walk task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
