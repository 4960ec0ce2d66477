//! Worker error types.

use thiserror::Error;

/// Worker errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Error raised by a job or the database.
    #[error("{0}")]
    Core(#[from] shardline_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Output encoding error.
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The job thread panicked or was cancelled.
    #[error("job aborted: {0}")]
    Aborted(String),
}
