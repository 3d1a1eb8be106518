//! Store-side application of replication results

use rusqlite::Connection;

use super::LocalStore;
use crate::conflict::{detect_conflicts, ConflictStrategy};
use crate::db::{
    CheckpointRepository, DocumentRepository, OperationRepository, SqliteCheckpointRepository,
    SqliteDocumentRepository, SqliteOperationRepository,
};
use crate::error::Result;
use crate::models::{now_millis, Document, PendingOperation, SyncConflict};

/// Result of applying one pulled batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOutcome {
    /// Documents written to the local store
    pub applied: usize,
    /// Documents already applied at this or a later server revision
    pub skipped: usize,
    /// Documents that raced a pending local write and were resolved
    pub conflicts: usize,
}

/// How a push conflict was settled locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResolution {
    /// The server already holds the resolved state; the target's operations were removed
    Settled,
    /// The resolved state differs from the server; the operation was rewritten and stays queued
    Requeued,
}

impl LocalStore {
    /// Apply a pulled batch and advance the collection checkpoint in one transaction.
    ///
    /// Documents at or below the last server revision seen for their id are
    /// skipped, so re-applying a batch leaves the store unchanged. A document
    /// with pending local operations goes through the conflict resolver
    /// instead of being overwritten.
    pub async fn apply_pulled(
        &self,
        collection: &str,
        incoming: &[Document],
        checkpoint: Option<&str>,
        strategy: ConflictStrategy,
    ) -> Result<PullOutcome> {
        let outcome = self
            .write(|conn| {
                let documents = SqliteDocumentRepository::new(conn);
                let operations = SqliteOperationRepository::new(conn);
                let mut outcome = PullOutcome::default();

                for remote in incoming {
                    let known = documents.remote_revision(&remote.id)?;
                    if known.is_some_and(|known| remote.revision <= known) {
                        outcome.skipped += 1;
                        continue;
                    }

                    let local = documents.get(&remote.id)?;
                    let pending = operations.list_for_target(&remote.id)?;
                    let stored = match (&local, pending.first()) {
                        (Some(local), Some(_)) if local.same_content(remote) => {
                            // Our own write came back before its acknowledgement did
                            operations.delete_for_target(&remote.id)?;
                            None
                        }
                        (Some(local), Some(head)) => {
                            let resolved = strategy.resolve(local, remote);
                            log_conflict(conn, local, remote, strategy)?;
                            outcome.conflicts += 1;

                            let stored = stamp_remote(Some(local), resolved);
                            if stored.same_content(remote) {
                                operations.delete_for_target(&remote.id)?;
                            } else {
                                // The push base is now the pulled revision; every queued
                                // write for the target collapses into the resolved head
                                operations.replace_payload(&head.operation_id, &stored)?;
                                for later in &pending[1..] {
                                    operations.delete(&later.operation_id)?;
                                }
                            }
                            Some(stored)
                        }
                        _ => Some(stamp_remote(local.as_ref(), remote.clone())),
                    };

                    if let Some(stored) = stored {
                        documents.upsert(&stored)?;
                    }
                    documents.set_remote_revision(&remote.id, remote.revision)?;
                    outcome.applied += 1;
                }

                if let Some(checkpoint) = checkpoint {
                    SqliteCheckpointRepository::new(conn).set(collection, checkpoint)?;
                }
                Ok(outcome)
            })
            .await?;

        tracing::debug!(
            "Applied pulled {collection} batch: {} applied, {} skipped, {} conflicts",
            outcome.applied,
            outcome.skipped,
            outcome.conflicts
        );
        Ok(outcome)
    }

    /// Settle an operation the server accepted.
    ///
    /// When no later operation exists for the target and the server's copy
    /// differs (for example a re-assigned queue token) the server copy is
    /// adopted locally.
    pub async fn acknowledge(
        &self,
        operation: &PendingOperation,
        accepted: Option<&Document>,
    ) -> Result<()> {
        self.write(|conn| {
            let documents = SqliteDocumentRepository::new(conn);
            let operations = SqliteOperationRepository::new(conn);
            operations.delete(&operation.operation_id)?;

            let Some(accepted) = accepted else {
                return Ok(());
            };
            documents.set_remote_revision(&operation.target_id, accepted.revision)?;

            if operations.list_for_target(&operation.target_id)?.is_empty() {
                if let Some(local) = documents.get(&operation.target_id)? {
                    if !local.same_content(accepted) {
                        tracing::info!(
                            "Adopting server copy of {}/{}",
                            accepted.collection,
                            accepted.id
                        );
                        documents.upsert(&stamp_remote(Some(&local), accepted.clone()))?;
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Resolve a push the server rejected as conflicting with `current`
    pub async fn resolve_push_conflict(
        &self,
        operation: &PendingOperation,
        current: &Document,
        strategy: ConflictStrategy,
    ) -> Result<PushResolution> {
        let target = operation.target_id.as_str();
        let resolution = self
            .write(|conn| {
                let documents = SqliteDocumentRepository::new(conn);
                let operations = SqliteOperationRepository::new(conn);

                let local = documents
                    .get(target)?
                    .unwrap_or_else(|| operation.payload.clone());
                let resolved = strategy.resolve(&local, current);
                if !local.same_content(current) {
                    log_conflict(conn, &local, current, strategy)?;
                }
                documents.set_remote_revision(target, current.revision)?;

                let stored = if resolved.same_content(&local) {
                    local
                } else {
                    let stored = stamp_remote(Some(&local), resolved);
                    documents.upsert(&stored)?;
                    stored
                };

                if stored.same_content(current) {
                    operations.delete_for_target(target)?;
                    return Ok(PushResolution::Settled);
                }

                // Later operations on the target are folded into the resolved state
                operations.replace_payload(&operation.operation_id, &stored)?;
                for later in operations.list_for_target(target)? {
                    if later.operation_id != operation.operation_id {
                        operations.delete(&later.operation_id)?;
                    }
                }
                Ok(PushResolution::Requeued)
            })
            .await?;

        tracing::debug!("Push conflict on {target} resolved: {resolution:?}");
        Ok(resolution)
    }
}

/// Remote-origin document with the next local revision
fn stamp_remote(previous: Option<&Document>, mut doc: Document) -> Document {
    doc.revision = previous.map_or(0, |previous| previous.revision) + 1;
    doc.created_at = doc
        .created_at
        .or_else(|| previous.and_then(|previous| previous.created_at));
    doc
}

fn log_conflict(
    conn: &Connection,
    local: &Document,
    remote: &Document,
    strategy: ConflictStrategy,
) -> Result<()> {
    let fields = detect_conflicts(local, remote).into_keys().collect::<Vec<_>>();
    tracing::warn!(
        "Conflict on {}/{} ({}), resolving with {strategy}",
        local.collection,
        local.id,
        fields.join(", ")
    );
    SqliteCheckpointRepository::new(conn).record_conflict(&SyncConflict {
        id: 0,
        document_id: local.id.clone(),
        collection: local.collection.clone(),
        local_updated_at: local.timestamp(),
        remote_updated_at: remote.timestamp(),
        fields,
        resolved_at: now_millis(),
        strategy: strategy.as_str().to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fields, OperationKind};
    use crate::store::Query;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn remote_patient(id: &str, name: &str, revision: i64, updated_at: i64) -> Document {
        let mut doc = Document::with_id(id, "patients", Fields::new()).set("name", name);
        doc.revision = revision;
        doc.created_at = Some(1);
        doc.updated_at = Some(updated_at);
        doc
    }

    async fn pending(store: &LocalStore) -> Vec<PendingOperation> {
        store
            .read(|conn| SqliteOperationRepository::new(conn).list())
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pull_is_idempotent() {
        let store = LocalStore::open_in_memory().unwrap();
        let batch = vec![remote_patient("p1", "Ada", 3, 100)];

        let first = store
            .apply_pulled("patients", &batch, Some("3"), ConflictStrategy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(first.applied, 1);
        let snapshot = store.query(&Query::all().include_deleted(true)).await.unwrap();

        let second = store
            .apply_pulled("patients", &batch, Some("3"), ConflictStrategy::LastWriteWins)
            .await
            .unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(
            store.query(&Query::all().include_deleted(true)).await.unwrap(),
            snapshot
        );
        assert_eq!(store.checkpoint("patients").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.remote_revision("p1").await.unwrap(), Some(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pull_overwrites_document_without_pending_writes() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .apply_pulled(
                "patients",
                &[remote_patient("p1", "Ada", 1, 100)],
                None,
                ConflictStrategy::LastWriteWins,
            )
            .await
            .unwrap();
        store
            .apply_pulled(
                "patients",
                &[remote_patient("p1", "Ada L.", 2, 200)],
                None,
                ConflictStrategy::LastWriteWins,
            )
            .await
            .unwrap();

        let local = store.get("p1").await.unwrap().unwrap();
        assert_eq!(local.get("name"), Some(&json!("Ada L.")));
        assert_eq!(local.revision, 2);
        assert_eq!(local.updated_at, Some(200));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pull_racing_pending_write_goes_through_resolver() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .apply_pulled(
                "patients",
                &[remote_patient("p1", "Ada", 1, 100)],
                None,
                ConflictStrategy::Merge,
            )
            .await
            .unwrap();
        let (local, _) = store
            .modify_tracked("p1", OperationKind::Update, |doc| Ok(doc.set("phone", "555-0100")))
            .await
            .unwrap();

        // Another device renamed the patient earlier than our local edit
        let remote = remote_patient("p1", "Ada Lovelace", 2, 150);
        let outcome = store
            .apply_pulled("patients", &[remote], None, ConflictStrategy::Merge)
            .await
            .unwrap();
        assert_eq!(outcome.conflicts, 1);

        let merged = store.get("p1").await.unwrap().unwrap();
        assert_eq!(merged.get("phone"), Some(&json!("555-0100")));
        assert_eq!(merged.get("name"), Some(&json!("Ada")));
        assert_eq!(merged.updated_at, local.updated_at);

        // The queued write now carries the resolved document
        let queued = pending(&store).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload, merged);

        let conflicts = store.list_conflicts(10).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].strategy, "merge");
        assert_eq!(conflicts[0].fields, vec!["name".to_string(), "phone".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pull_conflict_folds_every_queued_write_into_resolution() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .apply_pulled(
                "patients",
                &[remote_patient("p1", "Ada", 1, 100)],
                None,
                ConflictStrategy::Merge,
            )
            .await
            .unwrap();
        let (_, first) = store
            .modify_tracked("p1", OperationKind::Update, |doc| Ok(doc.set("phone", "555-0100")))
            .await
            .unwrap();
        store
            .modify_tracked("p1", OperationKind::Update, |doc| Ok(doc.set("name", "Ada L.")))
            .await
            .unwrap();
        assert_eq!(pending(&store).await.len(), 2);

        // Another device added an email while both edits were queued
        let remote = remote_patient("p1", "Ada", 2, 150).set("email", "ada@example.com");
        let outcome = store
            .apply_pulled("patients", &[remote], None, ConflictStrategy::Merge)
            .await
            .unwrap();
        assert_eq!(outcome.conflicts, 1);

        let merged = store.get("p1").await.unwrap().unwrap();
        assert_eq!(merged.get("email"), Some(&json!("ada@example.com")));
        assert_eq!(merged.get("name"), Some(&json!("Ada L.")));
        assert_eq!(merged.get("phone"), Some(&json!("555-0100")));

        let queued = pending(&store).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation_id, first.operation_id);
        assert!(queued.iter().all(|operation| operation.payload == merged));
        assert_eq!(store.remote_revision("p1").await.unwrap(), Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pull_of_own_echo_settles_pending_write() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = Document::with_id("p1", "patients", Fields::new()).set("name", "Ada");
        let (stored, _) = store.put_tracked(doc, OperationKind::Create).await.unwrap();

        let mut echo = stored.clone();
        echo.revision = 1;
        store
            .apply_pulled("patients", &[echo], Some("1"), ConflictStrategy::LastWriteWins)
            .await
            .unwrap();

        assert!(pending(&store).await.is_empty());
        assert!(store.list_conflicts(10).await.unwrap().is_empty());
        assert_eq!(store.get("p1").await.unwrap(), Some(stored));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acknowledge_adopts_server_copy() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = Document::with_id("q1", "queue", Fields::new())
            .set("patientId", "p1")
            .set("tokenNumber", 1)
            .set("triageLevel", "low")
            .set("status", "waiting")
            .set("queueDate", "2026-02-03");
        let (stored, operation) = store.put_tracked(doc, OperationKind::Create).await.unwrap();

        let mut accepted = stored.clone().set("tokenNumber", 4);
        accepted.revision = 12;
        store.acknowledge(&operation, Some(&accepted)).await.unwrap();

        let local = store.get("q1").await.unwrap().unwrap();
        assert_eq!(local.get("tokenNumber"), Some(&json!(4)));
        assert_eq!(local.revision, stored.revision + 1);
        assert_eq!(store.remote_revision("q1").await.unwrap(), Some(12));
        assert!(pending(&store).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_acknowledge_keeps_local_when_later_writes_pending() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = Document::with_id("p1", "patients", Fields::new()).set("name", "Ada");
        let (stored, first) = store.put_tracked(doc, OperationKind::Create).await.unwrap();
        let (latest, _) = store
            .modify_tracked("p1", OperationKind::Update, |doc| Ok(doc.set("name", "Ada L.")))
            .await
            .unwrap();

        let mut accepted = stored;
        accepted.revision = 1;
        store.acknowledge(&first, Some(&accepted)).await.unwrap();

        assert_eq!(store.get("p1").await.unwrap(), Some(latest));
        assert_eq!(pending(&store).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_conflict_settled_when_server_wins() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = Document::with_id("p1", "patients", Fields::new()).set("name", "Ada");
        let (stored, operation) = store.put_tracked(doc, OperationKind::Create).await.unwrap();

        let server = remote_patient("p1", "Ada (server)", 5, stored.updated_at.unwrap() + 10);
        let resolution = store
            .resolve_push_conflict(&operation, &server, ConflictStrategy::LastWriteWins)
            .await
            .unwrap();

        assert_eq!(resolution, PushResolution::Settled);
        assert!(pending(&store).await.is_empty());
        let local = store.get("p1").await.unwrap().unwrap();
        assert!(local.same_content(&server));
        assert_eq!(store.remote_revision("p1").await.unwrap(), Some(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_conflict_requeued_when_local_wins() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = Document::with_id("p1", "patients", Fields::new()).set("name", "Ada");
        let (_, operation) = store.put_tracked(doc, OperationKind::Create).await.unwrap();
        let (latest, _) = store
            .modify_tracked("p1", OperationKind::Update, |doc| Ok(doc.set("phone", "555-0100")))
            .await
            .unwrap();

        let server = remote_patient("p1", "Old name", 2, 5);
        let resolution = store
            .resolve_push_conflict(&operation, &server, ConflictStrategy::LastWriteWins)
            .await
            .unwrap();

        assert_eq!(resolution, PushResolution::Requeued);
        let queued = pending(&store).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation_id, operation.operation_id);
        assert_eq!(queued[0].payload, latest);
        assert_eq!(store.remote_revision("p1").await.unwrap(), Some(2));
        assert_eq!(store.list_conflicts(10).await.unwrap().len(), 1);
    }
}
