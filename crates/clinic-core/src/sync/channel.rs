//! Batched push/pull session with the central server

use std::collections::HashMap;

use super::pending::{Delivery, DrainReport, DrainStop, PendingWriteQueue};
use super::protocol::{PushItem, PushRequest, PushResult};
use super::transport::{RemoteTransport, TransportError};
use super::SyncError;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::models::{Document, OperationId, PendingOperation};
use crate::store::{LocalStore, PullOutcome};

/// Outcome of one push + pull cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: DrainReport,
    pub pulled: PullOutcome,
}

/// Resumable replication session.
///
/// Pushes carry each operation's idempotency key and the last server
/// revision seen for the document. Pulls resume from the stored checkpoint,
/// which only advances in the same transaction that applies the batch.
pub struct ReplicationChannel<T> {
    transport: T,
    store: LocalStore,
    queue: PendingWriteQueue,
    config: SyncConfig,
}

impl<T: RemoteTransport> ReplicationChannel<T> {
    pub const fn new(
        transport: T,
        store: LocalStore,
        queue: PendingWriteQueue,
        config: SyncConfig,
    ) -> Self {
        Self {
            transport,
            store,
            queue,
            config,
        }
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Push local changes, then pull remote ones
    pub async fn sync_cycle(&self) -> std::result::Result<SyncReport, SyncError> {
        let pushed = self.push().await?;
        let pulled = self.pull().await?;
        tracing::info!(
            "Sync cycle complete: {} pushed, {} pulled, {} conflicts",
            pushed.acknowledged,
            pulled.applied,
            pushed.resolved + pulled.conflicts
        );
        Ok(SyncReport { pushed, pulled })
    }

    /// Drain the pending write queue in bounded batches
    pub async fn push(&self) -> std::result::Result<DrainReport, SyncError> {
        let report = self
            .queue
            .drain_batched(self.config.push_batch_size, |batch| self.push_batch(batch))
            .await?;

        match &report.stopped {
            None => Ok(report),
            Some(DrainStop::AuthExpired) => Err(SyncError::AuthExpired),
            Some(DrainStop::Cancelled) => Err(SyncError::Cancelled),
            Some(DrainStop::Transient(message)) => Err(SyncError::Network(message.clone())),
        }
    }

    /// Pull every configured collection until the feed is exhausted
    pub async fn pull(&self) -> std::result::Result<PullOutcome, SyncError> {
        let mut total = PullOutcome::default();
        for collection in &self.config.collections {
            let outcome = self.pull_collection(collection).await?;
            total.applied += outcome.applied;
            total.skipped += outcome.skipped;
            total.conflicts += outcome.conflicts;
        }
        Ok(total)
    }

    async fn pull_collection(&self, collection: &str) -> std::result::Result<PullOutcome, SyncError> {
        let mut total = PullOutcome::default();
        loop {
            let since = self.store.checkpoint(collection).await?;
            let batch = self
                .config
                .retry
                .run("pull", || {
                    self.transport
                        .pull(collection, since.as_deref(), self.config.pull_batch_size)
                })
                .await?;

            let outcome = self
                .store
                .apply_pulled(
                    collection,
                    &batch.documents,
                    batch.checkpoint.as_deref(),
                    self.config.strategy,
                )
                .await?;
            total.applied += outcome.applied;
            total.skipped += outcome.skipped;
            total.conflicts += outcome.conflicts;

            if !batch.has_more || batch.documents.is_empty() {
                return Ok(total);
            }
        }
    }

    async fn push_batch(&self, batch: Vec<PendingOperation>) -> Result<Vec<Delivery>> {
        let mut items = Vec::with_capacity(batch.len());
        for operation in &batch {
            items.push(PushItem {
                operation_id: operation.operation_id,
                kind: operation.kind,
                collection: operation.collection.clone(),
                document: operation.payload.clone(),
                base_revision: self.store.remote_revision(&operation.target_id).await?,
            });
        }
        tracing::debug!("Pushing {} operations", items.len());

        let request = PushRequest { items };
        let response = match self
            .config
            .retry
            .run("push", || self.transport.push(request.clone()))
            .await
        {
            Ok(response) => response,
            Err(error) => return Ok(vec![delivery_for(&error); batch.len()]),
        };

        let mut results: HashMap<OperationId, PushResult> = response
            .results
            .into_iter()
            .map(|result| (*result.operation_id(), result))
            .collect();

        let mut deliveries = Vec::with_capacity(batch.len());
        for operation in &batch {
            let delivery = match results.remove(&operation.operation_id) {
                Some(PushResult::Accepted { document, .. }) => Delivery::Acknowledged(Some(document)),
                Some(PushResult::Rejected { reason, .. }) => Delivery::Rejected(reason),
                Some(PushResult::Conflict { current, .. }) => {
                    self.resolve_conflict(operation, current).await?
                }
                None => Delivery::Transient(format!(
                    "no result for operation {}",
                    operation.operation_id
                )),
            };
            deliveries.push(delivery);
        }
        Ok(deliveries)
    }

    async fn resolve_conflict(
        &self,
        operation: &PendingOperation,
        current: Option<Document>,
    ) -> Result<Delivery> {
        let current = match current {
            Some(current) => Some(current),
            None => {
                match self
                    .config
                    .retry
                    .run("fetch", || {
                        self.transport
                            .fetch(&operation.collection, &operation.target_id)
                    })
                    .await
                {
                    Ok(current) => current,
                    Err(error) => return Ok(delivery_for(&error)),
                }
            }
        };

        let Some(current) = current else {
            return Ok(Delivery::Rejected(
                "conflict reported without a server copy".to_string(),
            ));
        };
        self.store
            .resolve_push_conflict(operation, &current, self.config.strategy)
            .await?;
        Ok(Delivery::Resolved)
    }
}

fn delivery_for(error: &TransportError) -> Delivery {
    match error {
        TransportError::AuthExpired => Delivery::AuthExpired,
        TransportError::Rejected(reason) => Delivery::Rejected(reason.clone()),
        TransportError::Network(_) | TransportError::Server { .. } | TransportError::Decode(_) => {
            Delivery::Transient(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictStrategy;
    use crate::models::{Fields, OperationKind};
    use crate::sync::testing::MemoryRemote;
    use crate::sync::RetryPolicy;
    use serde_json::json;

    fn config() -> SyncConfig {
        SyncConfig::new()
            .with_retry_policy(RetryPolicy::none())
            .with_collections(["patients"])
    }

    fn channel(store: &LocalStore, config: SyncConfig) -> ReplicationChannel<MemoryRemote> {
        let queue = PendingWriteQueue::new(store.clone(), config.max_attempts);
        ReplicationChannel::new(MemoryRemote::new(), store.clone(), queue, config)
    }

    fn patient(name: &str) -> Document {
        Document::new("patients", Fields::new()).set("name", name)
    }

    async fn create_offline(store: &LocalStore, count: usize) -> Vec<Document> {
        let mut created = Vec::new();
        for i in 0..count {
            let (doc, _) = store
                .put_tracked(patient(&format!("Patient {i}")), OperationKind::Create)
                .await
                .unwrap();
            created.push(doc);
        }
        created
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_delivers_in_bounded_batches() {
        let store = LocalStore::open_in_memory().unwrap();
        let channel = channel(&store, config().with_batch_size(2));
        create_offline(&store, 5).await;

        let report = channel.push().await.unwrap();
        assert_eq!(report.acknowledged, 5);
        assert_eq!(channel.transport().push_calls(), 3);
        assert_eq!(channel.transport().effects(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lost_acknowledgements_do_not_duplicate_effects() {
        let store = LocalStore::open_in_memory().unwrap();
        let channel = channel(&store, config().with_batch_size(3));
        let created = create_offline(&store, 6).await;

        channel.transport().lose_next_acks(1);
        let error = channel.push().await.unwrap_err();
        assert!(matches!(error, SyncError::Network(_)));
        assert_eq!(channel.transport().effects(), 3);

        let report = channel.push().await.unwrap();
        assert_eq!(report.acknowledged, 6);
        assert_eq!(channel.transport().effects(), 6);
        for doc in created {
            assert!(channel.transport().document(&doc.id).is_some());
            assert!(store.remote_revision(&doc.id).await.unwrap().is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pull_applies_remote_changes_and_advances_checkpoint() {
        let store = LocalStore::open_in_memory().unwrap();
        let channel = channel(&store, config().with_pull_batch_size(2));
        for i in 0..5 {
            channel
                .transport()
                .remote_write(Document::new("patients", Fields::new()).set("name", format!("R{i}")));
        }

        let pulled = channel.pull().await.unwrap();
        assert_eq!(pulled.applied, 5);
        assert_eq!(store.checkpoint("patients").await.unwrap().as_deref(), Some("5"));

        let again = channel.pull().await.unwrap();
        assert_eq!(again, PullOutcome::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_push_conflict_resolved_and_requeued() {
        let store = LocalStore::open_in_memory().unwrap();
        let channel = channel(&store, config().with_strategy(ConflictStrategy::Merge));

        let (doc, _) = store
            .put_tracked(patient("Ada"), OperationKind::Create)
            .await
            .unwrap();
        channel.push().await.unwrap();

        // Another device edits first with an older clock
        let mut remote = channel.transport().document(&doc.id).unwrap();
        remote = remote.set("email", "ada@example.com");
        remote.updated_at = Some(1);
        channel.transport().remote_write(remote);

        store
            .modify_tracked(&doc.id, OperationKind::Update, |doc| Ok(doc.set("phone", "555-0100")))
            .await
            .unwrap();

        let report = channel.push().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(store.list_conflicts(10).await.unwrap().len(), 1);

        // The requeued merge goes out on the next push with the new base revision
        let report = channel.push().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        let server = channel.transport().document(&doc.id).unwrap();
        assert_eq!(server.get("phone"), Some(&json!("555-0100")));
        assert_eq!(server.get("email"), Some(&json!("ada@example.com")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auth_expiry_preserves_queue() {
        let store = LocalStore::open_in_memory().unwrap();
        let channel = channel(&store, config());
        create_offline(&store, 2).await;

        channel.transport().set_auth_expired(true);
        assert!(matches!(channel.push().await, Err(SyncError::AuthExpired)));
        assert!(matches!(channel.pull().await, Err(SyncError::AuthExpired)));

        let queue = PendingWriteQueue::new(store.clone(), 5);
        let remaining = queue.list().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|operation| operation.attempts == 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transient_push_failures_retry_with_backoff() {
        let store = LocalStore::open_in_memory().unwrap();
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
            multiplier: 2,
        };
        let channel = channel(&store, config().with_retry_policy(retry));
        create_offline(&store, 1).await;

        channel.transport().fail_next_pushes(2);
        let report = channel.push().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(channel.transport().push_calls(), 3);
    }
}
