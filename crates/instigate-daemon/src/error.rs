use instigate_core::InstigateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Core(#[from] InstigateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(String),

    #[error("giving up after {failures} consecutive failed iterations; last error: {last_error}")]
    Escalated { failures: u32, last_error: String },
}

impl From<tokio::task::JoinError> for DaemonError {
    fn from(e: tokio::task::JoinError) -> Self {
        DaemonError::Join(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
