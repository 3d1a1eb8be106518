//! Pending (not yet acknowledged) mutation model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::Document;

/// Client-generated idempotency key for a queued mutation (UUID v7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown operation kind: {other}")),
        }
    }
}

/// Delivery state of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    /// Waiting for (re)delivery
    #[default]
    Pending,
    /// Retry budget exhausted; surfaced to the user, still blocks its target
    Failed,
}

impl OperationState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown operation state: {other}")),
        }
    }
}

/// A queued mutation awaiting remote acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Idempotency key sent with every delivery attempt
    pub operation_id: OperationId,
    /// Document the mutation applies to
    pub target_id: String,
    /// Collection of the target document
    pub collection: String,
    pub kind: OperationKind,
    /// Full document state as of the mutation
    pub payload: Document,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
    /// Failed delivery attempts so far
    pub attempts: u32,
    pub state: OperationState,
    /// Reason of the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Create a pending operation capturing the given document state
    #[must_use]
    pub fn new(kind: OperationKind, payload: Document) -> Self {
        Self {
            operation_id: OperationId::new(),
            target_id: payload.id.clone(),
            collection: payload.collection.clone(),
            kind,
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
            attempts: 0,
            state: OperationState::Pending,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fields;

    #[test]
    fn test_operation_id_parse() {
        let id = OperationId::new();
        let parsed: OperationId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_new_operation_targets_document() {
        let doc = Document::new("patients", Fields::new());
        let op = PendingOperation::new(OperationKind::Create, doc.clone());
        assert_eq!(op.target_id, doc.id);
        assert_eq!(op.collection, "patients");
        assert_eq!(op.attempts, 0);
        assert_eq!(op.state, OperationState::Pending);
    }

    #[test]
    fn test_kind_and_state_round_trip_through_str() {
        for kind in [
            OperationKind::Create,
            OperationKind::Update,
            OperationKind::Delete,
        ] {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert_eq!("failed".parse::<OperationState>(), Ok(OperationState::Failed));
        assert!("bogus".parse::<OperationState>().is_err());
    }
}
