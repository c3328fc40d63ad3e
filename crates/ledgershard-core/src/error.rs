//! Core error types.

use thiserror::Error;

/// Core storage errors.
#[derive(Debug, Error)]
pub enum Error {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV writer error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
