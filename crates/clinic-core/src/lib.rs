//! clinic-core - Core library for clinic sync
//!
//! This crate contains the shared models, the device-local store, the
//! pending write queue, conflict resolution, queue prioritization and the
//! replication engine used by the clinic API server and CLI.

pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod priority;
pub mod schema;
pub mod state;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use conflict::ConflictStrategy;
pub use error::{Error, Result};
pub use models::{Document, Fields, NewQueueEntry, QueueEntry, QueueEntryUpdate};
pub use state::{SyncState, SyncStatus};
pub use store::{LocalStore, Query};
pub use sync::{HttpTransport, SyncEngine, SyncError};
