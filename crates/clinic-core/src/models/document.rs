//! Synchronized document model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Payload fields of a document, keyed by camelCase field name
pub type Fields = Map<String, Value>;

/// Wire names of document metadata; payload fields may not reuse them
pub const METADATA_FIELDS: &[&str] = &[
    "id",
    "collection",
    "revision",
    "createdAt",
    "updatedAt",
    "deleted",
];

/// Current time as a document timestamp (Unix ms)
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a new document id (UUID v7, time-sortable)
#[must_use]
pub fn new_document_id() -> String {
    Uuid::now_v7().to_string()
}

/// Any synchronized entity (patient record, queue entry, ...)
///
/// Metadata lives in named fields; everything else is flattened into
/// `fields` so the wire shape is a single camelCase JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Stable primary key, unique across local and remote
    pub id: String,
    /// Collection the document belongs to (e.g. `patients`)
    pub collection: String,
    /// Version marker assigned by the owning store
    #[serde(default)]
    pub revision: i64,
    /// Creation timestamp (Unix ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// Last update timestamp (Unix ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
    /// Schema-validated payload
    #[serde(flatten)]
    pub fields: Fields,
}

impl Document {
    /// Create a new, not yet stored document with a fresh id
    #[must_use]
    pub fn new(collection: impl Into<String>, fields: Fields) -> Self {
        Self::with_id(new_document_id(), collection, fields)
    }

    /// Create a new, not yet stored document with a caller-chosen id
    #[must_use]
    pub fn with_id(id: impl Into<String>, collection: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            revision: 0,
            created_at: None,
            updated_at: None,
            deleted: false,
            fields,
        }
    }

    /// Payload field by name
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a payload field, returning the document for chaining
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Field value including metadata (`id`, `revision`, `createdAt`, `updatedAt`, `deleted`).
    ///
    /// Used for sort keys so metadata and payload fields sort the same way.
    pub fn field_value(&self, field: &str) -> Value {
        match field {
            "id" => Value::from(self.id.clone()),
            "revision" => Value::from(self.revision),
            "createdAt" => self.created_at.map_or(Value::Null, Value::from),
            "updatedAt" => self.updated_at.map_or(Value::Null, Value::from),
            "deleted" => Value::from(self.deleted),
            other => self.fields.get(other).cloned().unwrap_or(Value::Null),
        }
    }

    /// Timestamp authoritative for conflict tiebreaks: `updatedAt`, falling back to `createdAt`
    pub fn timestamp(&self) -> Option<i64> {
        self.updated_at.or(self.created_at)
    }

    /// Whether two versions carry the same user-visible content (payload and tombstone)
    pub fn same_content(&self, other: &Self) -> bool {
        self.deleted == other.deleted && self.fields == other.fields
    }

    /// Tombstoned copy of this document; fields are retained so the deletion can replicate
    #[must_use]
    pub fn tombstone(&self) -> Self {
        let mut doc = self.clone();
        doc.deleted = true;
        doc
    }
}
