//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause (database, pool, json, etc.).

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed (rusqlite error).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to check out a reader connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error (e.g., poisoned writer lock, directory creation).
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid data supplied by the caller (e.g., missing `run_id`).
    #[error("invalid data: {0}")]
    InvalidData(String),
}
