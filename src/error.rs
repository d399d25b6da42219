use std::path::PathBuf;

/// Crate-wide error type. Library code returns this directly; the CLI
/// binary wraps it in `anyhow::Result` at the process boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("second factor required")]
    NeedsSecondFactor,

    #[error("remote error: {status} for {url}: {body}")]
    Remote {
        status: u16,
        url: String,
        body: String,
    },

    #[error("remote project has been deleted")]
    ProjectDeleted,

    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("local I/O error at {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::LocalIo {
            path: path.into(),
            source,
        }
    }
}
