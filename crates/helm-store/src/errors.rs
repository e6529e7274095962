//! `SQLite` backend errors.

use helm_core::StoreError;
use thiserror::Error;

/// Errors raised inside the `SQLite` backend.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// `rusqlite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// What failed.
        message: String,
    },
    /// The blocking worker panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// Stored JSON could not be decoded.
    #[error("invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, SqliteStoreError>;

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::Json(e) => StoreError::Serialization(e),
            other => StoreError::Backend(other.to_string()),
        }
    }
}
