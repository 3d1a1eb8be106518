//! Server-side document store backing the replication and queue endpoints

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clinic_core::models::{
    format_date, Document, NewQueueEntry, QueueEntry, QueueEntryUpdate, QueueStatus,
    QUEUE_COLLECTION,
};
use clinic_core::db::enable_wal;
use clinic_core::priority::prioritize;
use clinic_core::schema::SchemaRegistry;
use clinic_core::sync::{PullBatch, PushItem, PushResult};
use clinic_core::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use tokio::sync::Mutex;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY NOT NULL,
        collection TEXT NOT NULL,
        revision INTEGER NOT NULL,
        created_at INTEGER,
        updated_at INTEGER,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_documents_changes ON documents(collection, revision);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_token ON documents(
        json_extract(payload, '$.queueDate'),
        json_extract(payload, '$.tokenNumber')
    ) WHERE collection = 'queue';

    CREATE TABLE IF NOT EXISTS applied_operations (
        operation_id TEXT PRIMARY KEY NOT NULL,
        document_id TEXT NOT NULL,
        applied_at INTEGER NOT NULL
    );
";

const SELECT_COLUMNS: &str =
    "SELECT id, collection, revision, created_at, updated_at, is_deleted, payload FROM documents";

/// Authoritative copy of every replicated document.
///
/// Every document write takes the next value of one global revision
/// sequence, which doubles as the changes-feed checkpoint.
#[derive(Clone)]
pub struct ServerStore {
    conn: Arc<Mutex<Connection>>,
    schemas: Arc<SchemaRegistry>,
    token_retry_limit: u32,
}

impl ServerStore {
    pub fn open(path: impl AsRef<Path>, token_retry_limit: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?, token_retry_limit)
    }

    pub fn open_in_memory(token_retry_limit: u32) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, token_retry_limit)
    }

    fn from_connection(conn: Connection, token_retry_limit: u32) -> Result<Self> {
        let journal_mode = enable_wal(&conn)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Server store ready (journal_mode={journal_mode})");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            schemas: Arc::new(SchemaRegistry::clinic()),
            token_retry_limit: token_retry_limit.max(1),
        })
    }

    /// Run `f` in an immediate transaction under the store lock
    async fn transaction<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Apply a push batch item by item.
    ///
    /// Replayed operation ids are acknowledged with the current copy and
    /// produce no new revision. A stale base revision is a conflict.
    pub async fn push(&self, items: Vec<PushItem>) -> Result<Vec<PushResult>> {
        let schemas = Arc::clone(&self.schemas);
        let retry_limit = self.token_retry_limit;
        self.transaction(|tx| {
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                results.push(apply_push_item(tx, &schemas, retry_limit, item)?);
            }
            Ok(results)
        })
        .await
    }

    /// Changes feed for a collection, ordered by server revision
    pub async fn changes(&self, collection: &str, since: Option<i64>, limit: usize) -> Result<PullBatch> {
        let since = since.unwrap_or(0);
        let mut documents = self
            .transaction(|tx| {
                let mut stmt = tx.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE collection = ? AND revision > ? ORDER BY revision LIMIT ?"
                ))?;
                let documents = stmt
                    .query_map(
                        params![collection, since, i64::try_from(limit).unwrap_or(i64::MAX).saturating_add(1)],
                        parse_document,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(documents)
            })
            .await?;

        let has_more = documents.len() > limit;
        documents.truncate(limit);
        let checkpoint = documents
            .last()
            .map_or(since, |doc| doc.revision)
            .to_string();
        Ok(PullBatch {
            documents,
            checkpoint: Some(checkpoint),
            has_more,
        })
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.transaction(|tx| {
            Ok(get_document(tx, id)?.filter(|doc| doc.collection == collection))
        })
        .await
    }

    /// Create a queue entry with the next free token for its day.
    ///
    /// "Read max, add one, insert" runs in one immediate transaction; a
    /// uniqueness violation from a concurrent writer on the same database
    /// is retried up to the configured limit.
    pub async fn create_queue_entry(&self, entry: NewQueueEntry) -> Result<QueueEntry> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let entry = entry.clone();
            let result = self
                .transaction(|tx| {
                    let queue_date = format_date(entry.resolved_date());
                    let token = max_token(tx, &queue_date)? + 1;
                    let now = chrono::Utc::now().timestamp_millis();
                    let mut doc = entry.into_document(token);
                    doc.created_at = Some(now);
                    doc.updated_at = Some(now);
                    doc.revision = next_revision(tx)?;
                    upsert_document(tx, &doc)?;
                    Ok(doc)
                })
                .await;

            match result {
                Ok(doc) => return QueueEntry::from_document(&doc),
                Err(error) if error.is_retryable() && attempt < self.token_retry_limit => {
                    tracing::warn!("Token assignment collided ({error}); retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Entries in priority order, optionally filtered
    pub async fn list_queue(
        &self,
        status: Option<QueueStatus>,
        queue_date: Option<NaiveDate>,
    ) -> Result<Vec<QueueEntry>> {
        let documents = self
            .transaction(|tx| {
                let mut stmt = tx.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE collection = ? AND is_deleted = 0 ORDER BY revision"
                ))?;
                let documents = stmt
                    .query_map(params![QUEUE_COLLECTION], parse_document)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(documents)
            })
            .await?;

        let mut entries = Vec::with_capacity(documents.len());
        for doc in &documents {
            let entry = QueueEntry::from_document(doc)?;
            if status.is_some_and(|status| entry.status != status)
                || queue_date.is_some_and(|date| entry.queue_date != date)
            {
                continue;
            }
            entries.push(entry);
        }
        Ok(prioritize(entries))
    }

    pub async fn update_queue_entry(&self, id: &str, update: QueueEntryUpdate) -> Result<QueueEntry> {
        if update.is_empty() {
            return Err(Error::InvalidInput(
                "queue update must change status or triage level".to_string(),
            ));
        }
        let doc = self
            .transaction(|tx| {
                let mut doc = get_document(tx, id)?
                    .filter(|doc| doc.collection == QUEUE_COLLECTION && !doc.deleted)
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                update.apply(&mut doc);
                doc.updated_at = Some(chrono::Utc::now().timestamp_millis());
                doc.revision = next_revision(tx)?;
                upsert_document(tx, &doc)?;
                Ok(doc)
            })
            .await?;
        QueueEntry::from_document(&doc)
    }
}

fn apply_push_item(
    tx: &Transaction<'_>,
    schemas: &SchemaRegistry,
    retry_limit: u32,
    item: PushItem,
) -> Result<PushResult> {
    let operation_id = item.operation_id;
    let current = get_document(tx, &item.document.id)?;

    let replayed = tx
        .query_row(
            "SELECT 1 FROM applied_operations WHERE operation_id = ?",
            params![operation_id.as_str()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if replayed {
        if let Some(current) = current {
            tracing::debug!("Replay of {operation_id} acknowledged");
            return Ok(PushResult::Accepted {
                operation_id,
                document: current,
            });
        }
    }

    if item.collection != item.document.collection {
        return Ok(PushResult::Rejected {
            operation_id,
            reason: "collection does not match document".to_string(),
        });
    }
    if let Err(error) = schemas.validate(&item.document) {
        return Ok(PushResult::Rejected {
            operation_id,
            reason: error.to_string(),
        });
    }

    if let Some(current) = current.as_ref() {
        if current.collection != item.document.collection {
            return Ok(PushResult::Rejected {
                operation_id,
                reason: format!("document belongs to {}", current.collection),
            });
        }
        if item.base_revision != Some(current.revision) {
            tracing::debug!(
                "Conflict on {}: base {:?}, current {}",
                current.id,
                item.base_revision,
                current.revision
            );
            return Ok(PushResult::Conflict {
                operation_id,
                current: Some(current.clone()),
            });
        }
    }

    let mut doc = item.document;
    doc.created_at = current
        .as_ref()
        .and_then(|current| current.created_at)
        .or(doc.created_at);
    doc.revision = next_revision(tx)?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match upsert_document(tx, &doc) {
            Ok(()) => break,
            Err(error) if error.is_retryable() && attempt < retry_limit => {
                // The provisional client token is taken by another device's entry
                let queue_date = doc.field_value("queueDate");
                let queue_date = queue_date.as_str().unwrap_or_default();
                let token = max_token(tx, queue_date)? + 1;
                tracing::info!("Re-tokened {} to {token} for {queue_date}", doc.id);
                doc.fields.insert("tokenNumber".to_string(), Value::from(token));
            }
            Err(error) => return Err(error),
        }
    }

    tx.execute(
        "INSERT INTO applied_operations (operation_id, document_id, applied_at) VALUES (?, ?, ?)",
        params![
            operation_id.as_str(),
            doc.id,
            chrono::Utc::now().timestamp_millis()
        ],
    )?;
    Ok(PushResult::Accepted {
        operation_id,
        document: doc,
    })
}

fn next_revision(conn: &Connection) -> Result<i64> {
    let revision: i64 = conn.query_row(
        "SELECT COALESCE(MAX(revision), 0) + 1 FROM documents",
        [],
        |row| row.get(0),
    )?;
    Ok(revision)
}

fn max_token(conn: &Connection, queue_date: &str) -> Result<i64> {
    let token: i64 = conn.query_row(
        "SELECT COALESCE(MAX(json_extract(payload, '$.tokenNumber')), 0) FROM documents
         WHERE collection = ? AND json_extract(payload, '$.queueDate') = ?",
        params![QUEUE_COLLECTION, queue_date],
        |row| row.get(0),
    )?;
    Ok(token)
}

fn get_document(conn: &Connection, id: &str) -> Result<Option<Document>> {
    let doc = conn
        .query_row(
            &format!("{SELECT_COLUMNS} WHERE id = ?"),
            params![id],
            parse_document,
        )
        .optional()?;
    Ok(doc)
}

fn upsert_document(conn: &Connection, doc: &Document) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO documents (id, collection, revision, created_at, updated_at, is_deleted, payload)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            revision = excluded.revision,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            is_deleted = excluded.is_deleted,
            payload = excluded.payload",
        params![
            doc.id,
            doc.collection,
            doc.revision,
            doc.created_at,
            doc.updated_at,
            doc.deleted,
            Value::Object(doc.fields.clone()),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(failure, _))
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Err(Error::DuplicateToken {
                queue_date: doc
                    .get("queueDate")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                token: doc.get("tokenNumber").and_then(Value::as_i64).unwrap_or_default(),
            })
        }
        Err(error) => Err(error.into()),
    }
}

fn parse_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let payload: Value = row.get(6)?;
    let fields = match payload {
        Value::Object(fields) => fields,
        _ => serde_json::Map::new(),
    };
    let mut doc = Document::with_id(row.get::<_, String>(0)?, row.get::<_, String>(1)?, fields);
    doc.revision = row.get(2)?;
    doc.created_at = row.get(3)?;
    doc.updated_at = row.get(4)?;
    doc.deleted = row.get(5)?;
    Ok(doc)
}
