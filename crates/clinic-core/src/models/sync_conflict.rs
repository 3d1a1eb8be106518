//! Sync conflict model

use serde::{Deserialize, Serialize};

/// Recorded sync conflict resolved automatically by a strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Document involved in the conflict
    pub document_id: String,
    pub collection: String,
    /// Local version's timestamp when the conflict occurred
    pub local_updated_at: Option<i64>,
    /// Remote version's timestamp
    pub remote_updated_at: Option<i64>,
    /// Top-level fields whose values disagreed
    pub fields: Vec<String>,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}
