//! Error types for siren-core

use thiserror::Error;

use crate::models::ConflictStatus;

/// Result type alias using siren-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in siren-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Report not found
    #[error("Report not found: {0}")]
    NotFound(String),

    /// Caller's expected version no longer matches the stored version
    #[error("Version conflict: expected {expected}, current is {actual}")]
    VersionConflict {
        /// Version the caller fetched
        expected: i64,
        /// Version currently stored
        actual: i64,
    },

    /// Write lock could not be acquired within the busy timeout
    #[error("Database busy: write lock not acquired, retry with backoff")]
    Busy,

    /// A resolution strategy failed while executing
    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    /// A conflict record is already in a terminal state
    #[error("Conflict {id} is closed with status {status}")]
    ConflictClosed {
        /// Conflict record id
        id: i64,
        /// Terminal status the record holds
        status: ConflictStatus,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Busy
            }
            _ => Self::Database(err),
        }
    }
}
