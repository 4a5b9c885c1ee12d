//! Error types for the persistent channel store

use thiserror::Error;

/// Errors that can occur in a [`ChannelStore`](super::ChannelStore)
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness constraint violated
    #[error("Conflict: {0}")]
    Conflict(String),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool error
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Event detail (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Row contents could not be decoded
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Lock poisoned in an in-memory store
    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Map a rusqlite error, turning unique-constraint violations into `Conflict`
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => StoreError::Database(err),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
