//! Wire types shared by the replication client and server

use serde::{Deserialize, Serialize};

use crate::models::{Document, OperationId, OperationKind};

/// Largest push batch either side will exchange
pub const MAX_PUSH_BATCH: usize = 100;

/// One queued mutation sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItem {
    /// Idempotency key; replays of the same id are no-ops on the server
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub collection: String,
    /// Full document state as of the mutation
    pub document: Document,
    /// Server revision the change was made against; `None` for never-acknowledged documents
    #[serde(default)]
    pub base_revision: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub items: Vec<PushItem>,
}

/// Per-item outcome of a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PushResult {
    /// Applied (or already applied); `document` is the server's canonical copy
    #[serde(rename_all = "camelCase")]
    Accepted {
        operation_id: OperationId,
        document: Document,
    },
    /// The server copy moved on; `current` is its version when available
    #[serde(rename_all = "camelCase")]
    Conflict {
        operation_id: OperationId,
        #[serde(default)]
        current: Option<Document>,
    },
    /// Logically invalid; retrying unchanged will not help
    #[serde(rename_all = "camelCase")]
    Rejected {
        operation_id: OperationId,
        reason: String,
    },
}

impl PushResult {
    pub const fn operation_id(&self) -> &OperationId {
        match self {
            Self::Accepted { operation_id, .. }
            | Self::Conflict { operation_id, .. }
            | Self::Rejected { operation_id, .. } => operation_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<PushResult>,
}

/// One page of the server's changes feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullBatch {
    /// Changed documents ordered by server revision
    pub documents: Vec<Document>,
    /// Cursor to resume from; unchanged when the page is empty
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}
