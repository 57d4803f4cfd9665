use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op}({path}): {source}")]
    PathIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("journal {path}:{line}: {message}")]
    Journal {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{dir}: last backup dir and backup dir are the same")]
    SameDayBackup { dir: PathBuf },

    #[error("{dir}: directory not empty")]
    DirectoryNotEmpty { dir: PathBuf },

    #[error("command failed: {command}: {message}")]
    Command { command: String, message: String },

    #[error("signal setup failed: {message}")]
    Signal { message: String },

    #[error("manifest error: {message}")]
    Manifest { message: String },
}

impl Error {
    /// Wraps an OS error with the failing operation and the path it was applied to.
    pub fn path_io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PathIo {
            op,
            path: path.into(),
            source,
        }
    }
}
