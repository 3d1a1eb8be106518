use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] clinic_core::Error),
    #[error(transparent)]
    Sync(#[from] clinic_core::SyncError),
    #[error("Configuration error: {0}")]
    Config(#[from] clinic_core::config::ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("ID cannot be empty")]
    EmptyId,
    #[error("Patient name cannot be empty")]
    EmptyName,
    #[error("No {collection} record found for id/prefix: {query}")]
    NotFound { collection: String, query: String },
    #[error("{0}")]
    AmbiguousId(String),
    #[error("Sync server {0} is unreachable; local changes stay queued")]
    Unreachable(String),
    #[error("Sync is not configured. Set CLINIC_SYNC_URL and CLINIC_SYNC_TOKEN.")]
    SyncNotConfigured,
}
