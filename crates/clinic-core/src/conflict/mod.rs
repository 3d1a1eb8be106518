//! Conflict resolution between local and remote versions of a document.
//!
//! Both strategies are pure and never fail: given any two versions they
//! return a document. Absent timestamps are the only ambiguous input and
//! resolve in favour of the remote copy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::map::Entry;
use serde_json::{Map, Value};

use crate::models::Document;

/// Strategy used when a local and a remote version diverge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Whole document with the later timestamp wins
    #[default]
    LastWriteWins,
    /// Field-by-field merge starting from the local copy
    Merge,
}

impl ConflictStrategy {
    /// Resolve `local` against `remote` with this strategy
    pub fn resolve(self, local: &Document, remote: &Document) -> Document {
        match self {
            Self::LastWriteWins => resolve_last_write_wins(local, remote),
            Self::Merge => resolve_merge(local, remote),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lww" | "last_write_wins" | "last-write-wins" => Ok(Self::LastWriteWins),
            "merge" => Ok(Self::Merge),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

/// A disagreeing field reported by [`detect_conflicts`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldConflict {
    /// Scalar, array, or type mismatch
    Value,
    /// Both sides hold objects; the nested keys that disagree
    Nested(BTreeMap<String, FieldConflict>),
}

/// Pick the version with the later timestamp (`updatedAt`, falling back to `createdAt`).
///
/// Ties go to remote. A timestamp missing on one side yields the other side;
/// missing on both yields remote.
pub fn resolve_last_write_wins(local: &Document, remote: &Document) -> Document {
    match (local.timestamp(), remote.timestamp()) {
        (Some(local_ts), Some(remote_ts)) if local_ts > remote_ts => local.clone(),
        (Some(_), None) => local.clone(),
        _ => remote.clone(),
    }
}

/// Merge `remote` into `local` field by field.
///
/// Fields only present remotely are adopted. Fields present on both sides
/// with different values take the remote value only when remote is strictly
/// newer; nested objects recurse under the same rule. The tombstone flag is
/// treated like any other field. The result's `updatedAt` is the newer of the
/// two inputs.
pub fn resolve_merge(local: &Document, remote: &Document) -> Document {
    let remote_newer = remote_is_newer(local, remote);

    let mut merged = local.clone();
    merge_fields(&mut merged.fields, &remote.fields, remote_newer);
    if merged.deleted != remote.deleted && remote_newer {
        merged.deleted = remote.deleted;
    }
    merged.created_at = local.created_at.or(remote.created_at);
    merged.updated_at = local.updated_at.max(remote.updated_at);
    merged
}

/// Field names whose values differ between the two versions.
///
/// Nested objects report their own disagreeing keys. Performs no resolution.
pub fn detect_conflicts(local: &Document, remote: &Document) -> BTreeMap<String, FieldConflict> {
    let mut conflicts = diff_objects(&local.fields, &remote.fields);
    if local.deleted != remote.deleted {
        conflicts.insert("deleted".to_string(), FieldConflict::Value);
    }
    conflicts
}

fn remote_is_newer(local: &Document, remote: &Document) -> bool {
    match (local.timestamp(), remote.timestamp()) {
        (Some(local_ts), Some(remote_ts)) => remote_ts > local_ts,
        (None, _) => true,
        (Some(_), None) => false,
    }
}

fn merge_fields(target: &mut Map<String, Value>, remote: &Map<String, Value>, remote_newer: bool) {
    for (key, remote_value) in remote {
        match target.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(remote_value.clone());
            }
            Entry::Occupied(mut slot) => match (slot.get_mut(), remote_value) {
                (Value::Object(local_obj), Value::Object(remote_obj)) => {
                    merge_fields(local_obj, remote_obj, remote_newer);
                }
                (local_value, _) => {
                    if remote_newer && *local_value != *remote_value {
                        *local_value = remote_value.clone();
                    }
                }
            },
        }
    }
}

fn diff_objects(
    local: &Map<String, Value>,
    remote: &Map<String, Value>,
) -> BTreeMap<String, FieldConflict> {
    let mut conflicts = BTreeMap::new();
    for key in local.keys().chain(remote.keys()) {
        if conflicts.contains_key(key) {
            continue;
        }
        match (local.get(key), remote.get(key)) {
            (Some(Value::Object(a)), Some(Value::Object(b))) => {
                let nested = diff_objects(a, b);
                if !nested.is_empty() {
                    conflicts.insert(key.clone(), FieldConflict::Nested(nested));
                }
            }
            (a, b) if a != b => {
                conflicts.insert(key.clone(), FieldConflict::Value);
            }
            _ => {}
        }
    }
    conflicts
}
