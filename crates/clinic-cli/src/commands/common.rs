use std::env;
use std::path::{Path, PathBuf};

use clinic_core::models::{Document, PendingOperation, QueueEntry, SyncConflict};
use clinic_core::store::Query;
use clinic_core::sync::PendingWriteQueue;
use clinic_core::{HttpTransport, LocalStore, SyncConfig, SyncEngine};
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

/// Local store plus the sync settings every command runs against
pub struct Workspace {
    pub store: LocalStore,
    pub config: SyncConfig,
}

impl Workspace {
    pub const fn new(store: LocalStore, config: SyncConfig) -> Self {
        Self { store, config }
    }

    pub fn queue(&self) -> PendingWriteQueue {
        PendingWriteQueue::new(self.store.clone(), self.config.max_attempts)
    }

    /// Sync engine over HTTP; fails when no server is configured
    pub fn engine(&self) -> Result<SyncEngine<HttpTransport>, CliError> {
        if !self.config.is_remote_configured() {
            return Err(CliError::SyncNotConfigured);
        }
        let transport = HttpTransport::from_config(&self.config)?;
        Ok(SyncEngine::new(
            self.store.clone(),
            transport,
            self.config.clone().without_auto_sync(),
        ))
    }
}

pub fn open_workspace(db_path: &Path) -> Result<Workspace, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = LocalStore::open(db_path)?;
    let config = SyncConfig::from_env()?;
    if config.is_remote_configured() {
        tracing::debug!("Sync configured: {config:?}");
    }
    Ok(Workspace::new(store, config))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("CLINIC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(env::temp_dir)
        .join("clinic")
        .join("clinic.db")
}

/// Find a live document of `collection` by exact id or unique id prefix
pub async fn resolve_document(
    store: &LocalStore,
    collection: &str,
    query: &str,
) -> Result<Document, CliError> {
    let query = normalize_identifier(query)?;
    if let Some(doc) = store.get(&query).await? {
        if doc.collection == collection && !doc.deleted {
            return Ok(doc);
        }
    }

    let mut matches = store
        .query(&Query::collection(collection))
        .await?
        .into_iter()
        .filter(|doc| doc.id.starts_with(&query))
        .collect::<Vec<_>>();

    match matches.len() {
        0 => Err(CliError::NotFound {
            collection: collection.to_string(),
            query,
        }),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|doc| short_id(&doc.id))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn text_field<'a>(doc: &'a Document, field: &str) -> &'a str {
    doc.get(field).and_then(Value::as_str).unwrap_or("")
}

/// Collapse whitespace and cut to `max_chars`, marking truncation with `...`
pub fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

#[derive(Debug, Serialize)]
pub struct PendingItem {
    pub operation_id: String,
    pub kind: &'static str,
    pub collection: String,
    pub target_id: String,
    pub state: &'static str,
    pub attempts: u32,
    pub created_at_iso: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub fn pending_to_item(operation: &PendingOperation) -> PendingItem {
    PendingItem {
        operation_id: operation.operation_id.to_string(),
        kind: operation.kind.as_str(),
        collection: operation.collection.clone(),
        target_id: operation.target_id.clone(),
        state: operation.state.as_str(),
        attempts: operation.attempts,
        created_at_iso: format_timestamp(operation.created_at),
        last_error: operation.last_error.clone(),
    }
}

pub fn format_pending_lines(operations: &[PendingOperation]) -> Vec<String> {
    operations
        .iter()
        .map(|operation| {
            let line = format!(
                "{}  {:<7}  {:<6}  {}/{}  attempts={}",
                operation.operation_id,
                operation.state.as_str(),
                operation.kind.as_str(),
                operation.collection,
                short_id(&operation.target_id),
                operation.attempts
            );
            match operation.last_error.as_deref() {
                Some(error) => format!("{line}  last_error={}", preview(error, 60)),
                None => line,
            }
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub document_id: String,
    pub collection: String,
    pub fields: Vec<String>,
    pub local_updated_at: Option<i64>,
    pub remote_updated_at: Option<i64>,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        document_id: conflict.document_id.clone(),
        collection: conflict.collection.clone(),
        fields: conflict.fields.clone(),
        local_updated_at: conflict.local_updated_at,
        remote_updated_at: conflict.remote_updated_at,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_timestamp(conflict.resolved_at),
        strategy: conflict.strategy.clone(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<15}  {}/{}  fields={}",
                format_timestamp(conflict.resolved_at),
                conflict.strategy,
                conflict.collection,
                short_id(&conflict.document_id),
                conflict.fields.join(",")
            )
        })
        .collect()
}

pub fn format_queue_lines(entries: &[QueueEntry]) -> Vec<String> {
    entries
        .iter()
        .enumerate()
        .map(|(position, entry)| {
            format!(
                "{:>3}. #{:<4} {:<13}  {:<8}  {:<11}  patient={}",
                position + 1,
                entry.token_number,
                short_id(&entry.id),
                entry.triage_level.as_str(),
                entry.status.as_str(),
                short_id(&entry.patient_id)
            )
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}
