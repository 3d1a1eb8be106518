//! Database layer for the device-local store

mod checkpoint_repository;
mod connection;
mod document_repository;
mod migrations;
mod operation_repository;

pub use checkpoint_repository::{CheckpointRepository, SqliteCheckpointRepository};
pub use connection::{enable_wal, Database};
pub use document_repository::{DocumentRepository, SqliteDocumentRepository};
pub use operation_repository::{OperationRepository, SqliteOperationRepository};
