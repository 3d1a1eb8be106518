//! Device-local document store.
//!
//! `LocalStore` is the source of truth while disconnected. Every mutation
//! runs inside one `SQLite` transaction behind a single async lock, so writes
//! to a document are serialized and a revision is never assigned twice.

mod query;
mod replication;
mod subscription;

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::db::{
    CheckpointRepository, Database, DocumentRepository, OperationRepository,
    SqliteCheckpointRepository, SqliteDocumentRepository, SqliteOperationRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    format_date, now_millis, Document, Fields, NewQueueEntry, OperationKind, PendingOperation,
    QueueEntry, QueueEntryUpdate, QueueStatus, SyncConflict, QUEUE_COLLECTION,
};
use crate::priority::prioritize;
use crate::schema::SchemaRegistry;

pub use query::{compare_values, Query, SortKey};
pub use replication::{PullOutcome, PushResolution};
pub use subscription::Subscription;

use subscription::SubscriberRegistry;

/// Thread-safe handle to the local document store
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    schemas: Arc<SchemaRegistry>,
    subscribers: Arc<SubscriberRegistry>,
}

impl LocalStore {
    /// Open (or create) the store at the given path with the clinic schemas
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(Database::open(path)?))
    }

    /// Open an in-memory store (primarily for tests)
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            schemas: Arc::new(SchemaRegistry::clinic()),
            subscribers: Arc::new(SubscriberRegistry::default()),
        }
    }

    /// Replace the schema registry local writes are validated against
    #[must_use]
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = Arc::new(schemas);
        self
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Run a read against the connection under the store lock
    pub(crate) async fn read<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let db = self.db.lock().await;
        f(db.connection())
    }

    /// Run a mutation in one transaction under the store lock, then notify subscribers
    pub(crate) async fn write<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let result = {
            let db = self.db.lock().await;
            let tx = db.connection().unchecked_transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            result
        };
        self.subscribers.notify_all();
        Ok(result)
    }

    /// Validate and store a document, assigning the next revision
    pub async fn put(&self, doc: Document) -> Result<Document> {
        self.schemas.validate(&doc)?;
        let stored = self
            .write(|conn| {
                let documents = SqliteDocumentRepository::new(conn);
                let stored = stamp_local(documents.get(&doc.id)?.as_ref(), doc, now_millis())?;
                documents.upsert(&stored)?;
                Ok(stored)
            })
            .await?;
        tracing::debug!(
            "Stored {}/{} at revision {}",
            stored.collection,
            stored.id,
            stored.revision
        );
        Ok(stored)
    }

    /// Store a document and enqueue the matching pending operation atomically
    pub async fn put_tracked(
        &self,
        doc: Document,
        kind: OperationKind,
    ) -> Result<(Document, PendingOperation)> {
        self.schemas.validate(&doc)?;
        self.write(|conn| {
            let documents = SqliteDocumentRepository::new(conn);
            let stored = stamp_local(documents.get(&doc.id)?.as_ref(), doc, now_millis())?;
            documents.upsert(&stored)?;
            let operation = PendingOperation::new(kind, stored.clone());
            SqliteOperationRepository::new(conn).insert(&operation)?;
            Ok((stored, operation))
        })
        .await
    }

    /// Read-modify-write an existing live document and enqueue the change atomically
    pub async fn modify_tracked(
        &self,
        id: &str,
        kind: OperationKind,
        change: impl FnOnce(Document) -> Result<Document>,
    ) -> Result<(Document, PendingOperation)> {
        let schemas = Arc::clone(&self.schemas);
        self.write(|conn| {
            let documents = SqliteDocumentRepository::new(conn);
            let current = documents
                .get(id)?
                .filter(|doc| !doc.deleted)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;

            let changed = change(current.clone())?;
            if changed.id != current.id {
                return Err(Error::InvalidInput("document id cannot change".to_string()));
            }
            schemas.validate(&changed)?;

            let stored = stamp_local(Some(&current), changed, now_millis())?;
            documents.upsert(&stored)?;
            let operation = PendingOperation::new(kind, stored.clone());
            SqliteOperationRepository::new(conn).insert(&operation)?;
            Ok((stored, operation))
        })
        .await
    }

    /// Create a queue entry with the next token for its day and enqueue it.
    ///
    /// The token read and the insert happen in one transaction under the
    /// store lock, so concurrent creations on this device never share a token.
    pub async fn create_queue_entry(
        &self,
        entry: NewQueueEntry,
    ) -> Result<(Document, PendingOperation)> {
        let schemas = Arc::clone(&self.schemas);
        self.write(|conn| {
            let documents = SqliteDocumentRepository::new(conn);
            let queue_date = format_date(entry.resolved_date());
            let token = documents.max_queue_token(QUEUE_COLLECTION, &queue_date)? + 1;

            let doc = entry.into_document(token);
            schemas.validate(&doc)?;
            let stored = stamp_local(None, doc, now_millis())?;
            documents.upsert(&stored)?;

            let operation = PendingOperation::new(OperationKind::Create, stored.clone());
            SqliteOperationRepository::new(conn).insert(&operation)?;
            tracing::debug!("Assigned token {token} for {queue_date}");
            Ok((stored, operation))
        })
        .await
    }

    /// Patch a live document and enqueue the update; a `null` value removes the field
    pub async fn patch_tracked(
        &self,
        id: &str,
        patch: Fields,
    ) -> Result<(Document, PendingOperation)> {
        self.modify_tracked(id, OperationKind::Update, |mut doc| {
            for (field, value) in patch {
                if value.is_null() {
                    doc.fields.remove(&field);
                } else {
                    doc.fields.insert(field, value);
                }
            }
            Ok(doc)
        })
        .await
    }

    /// Tombstone a live document and enqueue the deletion
    pub async fn delete_tracked(&self, id: &str) -> Result<(Document, PendingOperation)> {
        self.modify_tracked(id, OperationKind::Delete, |doc| Ok(doc.tombstone()))
            .await
    }

    /// Change a queue entry's status or triage level and enqueue the update
    pub async fn update_queue_entry(
        &self,
        id: &str,
        update: QueueEntryUpdate,
    ) -> Result<(QueueEntry, PendingOperation)> {
        if update.is_empty() {
            return Err(Error::InvalidInput(
                "queue update must change status or triage level".to_string(),
            ));
        }
        let (doc, operation) = self
            .modify_tracked(id, OperationKind::Update, |mut doc| {
                if doc.collection != QUEUE_COLLECTION {
                    return Err(Error::InvalidInput(format!("{id} is not a queue entry")));
                }
                update.apply(&mut doc);
                Ok(doc)
            })
            .await?;
        Ok((QueueEntry::from_document(&doc)?, operation))
    }

    /// Live queue entries in priority order
    pub async fn queue_entries(
        &self,
        queue_date: Option<NaiveDate>,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueEntry>> {
        let mut query = Query::collection(QUEUE_COLLECTION);
        if let Some(date) = queue_date {
            query = query.where_eq("queueDate", format_date(date));
        }
        if let Some(status) = status {
            query = query.where_eq("status", status.as_str());
        }

        let entries = self
            .query(&query)
            .await?
            .iter()
            .map(QueueEntry::from_document)
            .collect::<Result<Vec<_>>>()?;
        Ok(prioritize(entries))
    }

    /// Get a document by ID, tombstones included
    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        self.read(|conn| SqliteDocumentRepository::new(conn).get(id))
            .await
    }

    /// Point-in-time snapshot of the documents matching a query
    pub async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        let documents = self
            .read(|conn| {
                SqliteDocumentRepository::new(conn)
                    .list(query.collection_name(), query.includes_deleted())
            })
            .await?;
        Ok(query.apply(documents))
    }

    /// Live snapshots of a query's result set
    pub fn subscribe(&self, query: Query) -> Subscription {
        Subscription::new(self.clone(), query)
    }

    /// Last server revision observed for a document
    pub async fn remote_revision(&self, id: &str) -> Result<Option<i64>> {
        self.read(|conn| SqliteDocumentRepository::new(conn).remote_revision(id))
            .await
    }

    /// Pull cursor for a collection
    pub async fn checkpoint(&self, collection: &str) -> Result<Option<String>> {
        self.read(|conn| SqliteCheckpointRepository::new(conn).get(collection))
            .await
    }

    /// Most recent automatic conflict resolutions
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.read(|conn| SqliteCheckpointRepository::new(conn).list_conflicts(limit))
            .await
    }
}

/// Assign local metadata to a document about to be written.
///
/// The revision advances by one, `createdAt` is kept from the first write,
/// and `updatedAt` never moves backwards for the same document.
fn stamp_local(previous: Option<&Document>, mut doc: Document, now: i64) -> Result<Document> {
    match previous {
        Some(previous) => {
            if previous.collection != doc.collection {
                return Err(Error::InvalidInput(format!(
                    "document {} belongs to {}",
                    doc.id, previous.collection
                )));
            }
            doc.revision = previous.revision + 1;
            doc.created_at = previous.created_at.or(doc.created_at);
            doc.updated_at = Some(previous.timestamp().map_or(now, |ts| now.max(ts + 1)));
        }
        None => {
            let created_at = doc.created_at.unwrap_or(now);
            doc.revision = 1;
            doc.created_at = Some(created_at);
            doc.updated_at = Some(now.max(created_at));
        }
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fields, TriageLevel};
    use crate::schema::SchemaError;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn patient(name: &str) -> Document {
        Document::new("patients", Fields::new()).set("name", name)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_assigns_increasing_revisions() {
        let store = LocalStore::open_in_memory().unwrap();

        let first = store.put(patient("Ada")).await.unwrap();
        assert_eq!(first.revision, 1);
        assert!(first.created_at.is_some());

        let second = store.put(first.clone().set("phone", "555-0100")).await.unwrap();
        assert_eq!(second.revision, 2);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);

        assert_eq!(store.get(&first.id).await.unwrap(), Some(second));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_rejects_invalid_documents() {
        let store = LocalStore::open_in_memory().unwrap();

        let missing_name = Document::new("patients", Fields::new());
        let error = store.put(missing_name).await.unwrap_err();
        assert!(matches!(
            error,
            Error::Schema(SchemaError::MissingField { .. })
        ));

        let unknown = Document::new("invoices", Fields::new());
        assert!(matches!(
            store.put(unknown).await.unwrap_err(),
            Error::Schema(SchemaError::UnknownCollection(_))
        ));
        assert!(store.query(&Query::all()).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_payload_cannot_shadow_metadata() {
        let store = LocalStore::open_in_memory().unwrap();

        let shadowing = patient("Bad").set("updatedAt", 5);
        assert!(matches!(
            store.put_tracked(shadowing, OperationKind::Create).await.unwrap_err(),
            Error::Schema(SchemaError::ReservedField { ref field, .. }) if field == "updatedAt"
        ));

        let (stored, _) = store
            .put_tracked(patient("Ada"), OperationKind::Create)
            .await
            .unwrap();
        let mut patch = Fields::new();
        patch.insert("revision".into(), json!(1));
        assert!(matches!(
            store.patch_tracked(&stored.id, patch).await.unwrap_err(),
            Error::Schema(SchemaError::ReservedField { .. })
        ));

        assert_eq!(store.get(&stored.id).await.unwrap(), Some(stored));
        let queued = store
            .read(|conn| SqliteOperationRepository::new(conn).list())
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_rejects_collection_change() {
        let store = LocalStore::open_in_memory().unwrap();
        let stored = store.put(patient("Ada")).await.unwrap();

        let mut moved = stored.clone();
        moved.collection = "doctors".to_string();
        assert!(matches!(
            store.put(moved).await.unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_tracked_enqueues_operation() {
        let store = LocalStore::open_in_memory().unwrap();
        let (stored, operation) = store
            .put_tracked(patient("Ada"), OperationKind::Create)
            .await
            .unwrap();

        assert_eq!(operation.target_id, stored.id);
        assert_eq!(operation.payload, stored);
        let queued = store
            .read(|conn| SqliteOperationRepository::new(conn).list())
            .await
            .unwrap();
        assert_eq!(queued, vec![operation]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_modify_tracked_requires_live_document() {
        let store = LocalStore::open_in_memory().unwrap();
        let stored = store.put(patient("Ada")).await.unwrap();

        let (deleted, operation) = store
            .modify_tracked(&stored.id, OperationKind::Delete, |doc| Ok(doc.tombstone()))
            .await
            .unwrap();
        assert!(deleted.deleted);
        assert_eq!(operation.kind, OperationKind::Delete);

        let again = store
            .modify_tracked(&stored.id, OperationKind::Update, Ok)
            .await
            .unwrap_err();
        assert!(matches!(again, Error::NotFound(_)));

        // Tombstones stay queryable on request
        let all = store
            .query(&Query::collection("patients").include_deleted(true))
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queue_tokens_are_unique_under_concurrency() {
        let store = LocalStore::open_in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 2, 3).unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let entry = NewQueueEntry::new(format!("patient-{i}"), TriageLevel::Medium).on(date);
                store.create_queue_entry(entry).await.unwrap().0
            }));
        }

        let mut tokens = HashSet::new();
        for handle in handles {
            let doc = handle.await.unwrap();
            let token = doc.get("tokenNumber").and_then(serde_json::Value::as_i64).unwrap();
            assert!(tokens.insert(token), "duplicate token {token}");
        }
        assert_eq!(tokens, (1..=20).collect::<HashSet<i64>>());

        let next_day = NewQueueEntry::new("p", TriageLevel::Low).on(date.succ_opt().unwrap());
        let (doc, _) = store.create_queue_entry(next_day).await.unwrap();
        assert_eq!(doc.get("tokenNumber"), Some(&json!(1)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_survives_restart() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("clinic.db");

        let stored = {
            let store = LocalStore::open(&path).unwrap();
            store
                .put_tracked(patient("Ada"), OperationKind::Create)
                .await
                .unwrap()
                .0
        };

        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.get(&stored.id).await.unwrap(), Some(stored));
        let queued = reopened
            .read(|conn| SqliteOperationRepository::new(conn).count(None))
            .await
            .unwrap();
        assert_eq!(queued, 1);
    }

    #[test]
    fn test_stamp_local_never_moves_time_backwards() {
        let mut previous = patient("Ada");
        previous.revision = 4;
        previous.created_at = Some(10);
        previous.updated_at = Some(1_000);

        let stamped = stamp_local(Some(&previous), previous.clone(), 500).unwrap();
        assert_eq!(stamped.revision, 5);
        assert_eq!(stamped.created_at, Some(10));
        assert_eq!(stamped.updated_at, Some(1_001));
    }
}
