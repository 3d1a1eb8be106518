//! Error types for clinic-core

use thiserror::Error;

use crate::schema::SchemaError;

/// Result type alias using clinic-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in clinic-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document or operation not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Local write rejected by the collection schema
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Token already taken for the day; the caller should retry assignment
    #[error("Token {token} is already assigned for {queue_date}")]
    DuplicateToken { queue_date: String, token: i64 },
}

impl Error {
    /// Whether the failed operation can be attempted again as-is.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DuplicateToken { .. })
    }
}
