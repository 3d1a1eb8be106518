//! Data models for clinic sync

mod document;
mod pending_operation;
mod queue_entry;
mod sync_conflict;

pub use document::{new_document_id, now_millis, Document, Fields, METADATA_FIELDS};
pub use pending_operation::{OperationId, OperationKind, OperationState, PendingOperation};
pub use queue_entry::{
    format_date, NewQueueEntry, QueueEntry, QueueEntryUpdate, QueueStatus, TriageLevel,
    QUEUE_COLLECTION,
};
pub use sync_conflict::SyncConflict;
