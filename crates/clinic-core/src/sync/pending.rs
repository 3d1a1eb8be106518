//! Durable queue of not-yet-acknowledged mutations

use std::collections::HashSet;
use std::future::Future;

use crate::db::{OperationRepository, SqliteOperationRepository};
use crate::error::{Error, Result};
use crate::models::{Document, OperationId, OperationState, PendingOperation};
use crate::store::LocalStore;

/// Default per-operation retry budget for logical failures
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Outcome of delivering one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The remote applied the operation (or had already applied it)
    Acknowledged(Option<Document>),
    /// A conflict was resolved and the queue already reflects the resolution
    Resolved,
    /// The remote refused the operation; counts against its retry budget
    Rejected(String),
    /// Network-level failure; counts an attempt and ends the drain cycle
    Transient(String),
    /// Session expired; ends the drain cycle with the operation untouched
    AuthExpired,
    /// Delivery was cancelled; ends the drain cycle with the operation untouched
    Cancelled,
}

/// Why a drain cycle ended before the queue was exhausted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStop {
    Transient(String),
    AuthExpired,
    Cancelled,
}

/// Summary of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub acknowledged: usize,
    pub resolved: usize,
    pub rejected: usize,
    /// Operations that exhausted their retry budget during this cycle
    pub dead_lettered: usize,
    pub stopped: Option<DrainStop>,
}

/// Persisted, ordered list of pending operations.
///
/// Operations on the same target are delivered strictly in enqueue order:
/// only the oldest operation of a target is ever eligible, and a failed
/// operation blocks its target until retried or discarded. Operations on
/// other targets keep flowing.
#[derive(Clone)]
pub struct PendingWriteQueue {
    store: LocalStore,
    max_attempts: u32,
}

impl PendingWriteQueue {
    pub fn new(store: LocalStore, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Append an operation at the tail; durable once this returns
    pub async fn enqueue(&self, operation: &PendingOperation) -> Result<()> {
        self.store
            .write(|conn| SqliteOperationRepository::new(conn).insert(operation))
            .await?;
        tracing::debug!(
            "Queued {} {} for {}",
            operation.kind.as_str(),
            operation.operation_id,
            operation.target_id
        );
        Ok(())
    }

    /// Every queued operation, oldest first
    pub async fn list(&self) -> Result<Vec<PendingOperation>> {
        self.store
            .read(|conn| SqliteOperationRepository::new(conn).list())
            .await
    }

    /// Operations not yet acknowledged, dead-lettered ones included
    pub async fn pending_count(&self) -> Result<usize> {
        self.store
            .read(|conn| SqliteOperationRepository::new(conn).count(None))
            .await
    }

    pub async fn failed_count(&self) -> Result<usize> {
        self.store
            .read(|conn| SqliteOperationRepository::new(conn).count(Some(OperationState::Failed)))
            .await
    }

    /// Dead-lettered operations awaiting a decision
    pub async fn failed(&self) -> Result<Vec<PendingOperation>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|operation| operation.state == OperationState::Failed)
            .collect())
    }

    /// Give every dead-lettered operation a fresh retry budget
    pub async fn retry_failed(&self) -> Result<usize> {
        let count = self
            .store
            .write(|conn| SqliteOperationRepository::new(conn).reset_failed())
            .await?;
        if count > 0 {
            tracing::info!("Re-armed {count} failed operations");
        }
        Ok(count)
    }

    /// Drop an operation without delivering it
    pub async fn discard(&self, id: &OperationId) -> Result<()> {
        let removed = self
            .store
            .write(|conn| SqliteOperationRepository::new(conn).delete(id))
            .await?;
        if !removed {
            return Err(Error::NotFound(id.to_string()));
        }
        tracing::warn!("Discarded pending operation {id}");
        Ok(())
    }

    /// Deliver operations one at a time
    pub async fn drain<F, Fut>(&self, mut send: F) -> Result<DrainReport>
    where
        F: FnMut(PendingOperation) -> Fut,
        Fut: Future<Output = Delivery>,
    {
        self.drain_batched(1, move |batch| {
            let deliveries = batch.into_iter().map(&mut send).collect::<Vec<_>>();
            async move {
                let mut results = Vec::with_capacity(deliveries.len());
                for delivery in deliveries {
                    results.push(delivery.await);
                }
                Ok(results)
            }
        })
        .await
    }

    /// Deliver operations in batches of at most `batch_size`.
    ///
    /// `send` returns one [`Delivery`] per operation, in order. Operations
    /// are only updated after `send` completes, so a cancelled send leaves
    /// its batch exactly as it was.
    pub async fn drain_batched<F, Fut>(&self, batch_size: usize, mut send: F) -> Result<DrainReport>
    where
        F: FnMut(Vec<PendingOperation>) -> Fut,
        Fut: Future<Output = Result<Vec<Delivery>>>,
    {
        let batch_size = batch_size.max(1);
        let mut report = DrainReport::default();
        let mut held_targets = HashSet::new();

        loop {
            let batch = next_batch(&self.list().await?, &held_targets, batch_size);
            if batch.is_empty() {
                break;
            }

            let mut deliveries = send(batch.clone()).await?.into_iter();
            for operation in batch {
                let delivery = deliveries
                    .next()
                    .unwrap_or_else(|| Delivery::Transient("no result for operation".to_string()));
                match delivery {
                    Delivery::Acknowledged(document) => {
                        self.store.acknowledge(&operation, document.as_ref()).await?;
                        report.acknowledged += 1;
                    }
                    Delivery::Resolved => {
                        held_targets.insert(operation.target_id);
                        report.resolved += 1;
                    }
                    Delivery::Rejected(reason) => {
                        if self.record_rejection(&operation, &reason).await? == OperationState::Failed {
                            report.dead_lettered += 1;
                        }
                        held_targets.insert(operation.target_id);
                        report.rejected += 1;
                    }
                    Delivery::Transient(reason) => {
                        self.record_attempt(&operation, OperationState::Pending, &reason)
                            .await?;
                        report.stopped = Some(DrainStop::Transient(reason));
                    }
                    Delivery::AuthExpired => report.stopped = Some(DrainStop::AuthExpired),
                    Delivery::Cancelled => report.stopped = Some(DrainStop::Cancelled),
                }
            }

            if report.stopped.is_some() {
                break;
            }
        }

        tracing::debug!("Drain finished: {report:?}");
        Ok(report)
    }

    async fn record_rejection(
        &self,
        operation: &PendingOperation,
        reason: &str,
    ) -> Result<OperationState> {
        let state = if operation.attempts + 1 >= self.max_attempts {
            tracing::warn!(
                "Operation {} on {} failed permanently: {reason}",
                operation.operation_id,
                operation.target_id
            );
            OperationState::Failed
        } else {
            tracing::warn!(
                "Operation {} on {} rejected: {reason}",
                operation.operation_id,
                operation.target_id
            );
            OperationState::Pending
        };
        self.record_attempt(operation, state, reason).await?;
        Ok(state)
    }

    async fn record_attempt(
        &self,
        operation: &PendingOperation,
        state: OperationState,
        reason: &str,
    ) -> Result<()> {
        self.store
            .write(|conn| {
                SqliteOperationRepository::new(conn).record_failure(
                    &operation.operation_id,
                    operation.attempts + 1,
                    state,
                    reason,
                )
            })
            .await
    }
}

/// Oldest operation of each target, skipping failed and held targets
fn next_batch(
    operations: &[PendingOperation],
    held_targets: &HashSet<String>,
    limit: usize,
) -> Vec<PendingOperation> {
    let mut seen = HashSet::new();
    let mut batch = Vec::new();
    for operation in operations {
        if !seen.insert(operation.target_id.as_str()) {
            continue;
        }
        if operation.state == OperationState::Failed || held_targets.contains(&operation.target_id) {
            continue;
        }
        batch.push(operation.clone());
        if batch.len() == limit {
            break;
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fields, OperationKind};
    use std::future::ready;
    use tempfile::tempdir;

    fn patient(id: &str, name: &str) -> Document {
        Document::with_id(id, "patients", Fields::new()).set("name", name)
    }

    async fn seed(store: &LocalStore, writes: &[(&str, &str)]) -> Vec<PendingOperation> {
        let mut operations = Vec::new();
        for (id, name) in writes {
            let kind = if store.get(id).await.unwrap().is_some() {
                OperationKind::Update
            } else {
                OperationKind::Create
            };
            let (_, operation) = store.put_tracked(patient(id, name), kind).await.unwrap();
            operations.push(operation);
        }
        operations
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_persists_across_restart() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("clinic.db");
        {
            let store = LocalStore::open(&path).unwrap();
            store.put(patient("p1", "Ada")).await.unwrap();
            let queue = PendingWriteQueue::new(store.clone(), 5);
            let operation = PendingOperation::new(
                OperationKind::Update,
                store.get("p1").await.unwrap().unwrap(),
            );
            queue.enqueue(&operation).await.unwrap();
        }

        let queue = PendingWriteQueue::new(LocalStore::open(&path).unwrap(), 5);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drain_acknowledges_in_order() {
        let store = LocalStore::open_in_memory().unwrap();
        let queue = PendingWriteQueue::new(store.clone(), 5);
        let operations = seed(&store, &[("p1", "Ada"), ("p2", "Bo"), ("p1", "Ada L.")]).await;

        let mut sent = Vec::new();
        let report = queue
            .drain(|operation| {
                sent.push(operation.operation_id);
                ready(Delivery::Acknowledged(None))
            })
            .await
            .unwrap();

        assert_eq!(report.acknowledged, 3);
        assert_eq!(
            sent,
            operations.iter().map(|op| op.operation_id).collect::<Vec<_>>()
        );
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejection_holds_target_but_not_others() {
        let store = LocalStore::open_in_memory().unwrap();
        let queue = PendingWriteQueue::new(store.clone(), 5);
        let operations = seed(&store, &[("p1", "Ada"), ("p2", "Bo"), ("p1", "Ada L.")]).await;

        let mut sent = Vec::new();
        let report = queue
            .drain(|operation| {
                sent.push(operation.target_id.clone());
                if operation.target_id == "p1" {
                    ready(Delivery::Rejected("invalid".to_string()))
                } else {
                    ready(Delivery::Acknowledged(None))
                }
            })
            .await
            .unwrap();

        assert_eq!(sent, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.acknowledged, 1);

        let remaining = queue.list().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].operation_id, operations[0].operation_id);
        assert_eq!(remaining[0].attempts, 1);
        assert_eq!(remaining[0].last_error.as_deref(), Some("invalid"));
        assert_eq!(remaining[1].operation_id, operations[2].operation_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transient_failure_stops_cycle() {
        let store = LocalStore::open_in_memory().unwrap();
        let queue = PendingWriteQueue::new(store.clone(), 5);
        seed(&store, &[("p1", "Ada"), ("p2", "Bo")]).await;

        let mut calls = 0;
        let report = queue
            .drain(|_| {
                calls += 1;
                ready(Delivery::Transient("connection reset".to_string()))
            })
            .await
            .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(
            report.stopped,
            Some(DrainStop::Transient("connection reset".to_string()))
        );
        let remaining = queue.list().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].attempts, 1);
        assert_eq!(remaining[0].state, OperationState::Pending);
        assert_eq!(remaining[1].attempts, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_and_auth_expiry_leave_operations_untouched() {
        let store = LocalStore::open_in_memory().unwrap();
        let queue = PendingWriteQueue::new(store.clone(), 5);
        let before = seed(&store, &[("p1", "Ada")]).await;

        for delivery in [Delivery::Cancelled, Delivery::AuthExpired] {
            let report = queue
                .drain(|_| ready(delivery.clone()))
                .await
                .unwrap();
            assert!(report.stopped.is_some());
            assert_eq!(queue.list().await.unwrap(), before);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dead_letter_blocks_target_until_retried() {
        let store = LocalStore::open_in_memory().unwrap();
        let queue = PendingWriteQueue::new(store.clone(), 2);
        seed(&store, &[("p1", "Ada"), ("p1", "Ada L.")]).await;

        let reject = |_: PendingOperation| ready(Delivery::Rejected("nope".to_string()));
        queue.drain(reject).await.unwrap();
        let report = queue.drain(reject).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(queue.failed_count().await.unwrap(), 1);
        assert_eq!(queue.pending_count().await.unwrap(), 2);

        // Nothing on p1 is eligible while its head is dead-lettered
        let mut calls = 0;
        queue
            .drain(|_| {
                calls += 1;
                ready(Delivery::Acknowledged(None))
            })
            .await
            .unwrap();
        assert_eq!(calls, 0);

        assert_eq!(queue.retry_failed().await.unwrap(), 1);
        let report = queue
            .drain(|_| ready(Delivery::Acknowledged(None)))
            .await
            .unwrap();
        assert_eq!(report.acknowledged, 2);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discard_removes_operation() {
        let store = LocalStore::open_in_memory().unwrap();
        let queue = PendingWriteQueue::new(store.clone(), 5);
        let operations = seed(&store, &[("p1", "Ada")]).await;

        queue.discard(&operations[0].operation_id).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert!(matches!(
            queue.discard(&operations[0].operation_id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batches_take_one_operation_per_target() {
        let store = LocalStore::open_in_memory().unwrap();
        let queue = PendingWriteQueue::new(store.clone(), 5);
        seed(
            &store,
            &[("p1", "A"), ("p1", "B"), ("p2", "C"), ("p3", "D"), ("p1", "E")],
        )
        .await;

        let mut batches = Vec::new();
        let report = queue
            .drain_batched(10, |batch| {
                batches.push(
                    batch
                        .iter()
                        .map(|operation| operation.target_id.clone())
                        .collect::<Vec<_>>(),
                );
                let deliveries = vec![Delivery::Acknowledged(None); batch.len()];
                ready(Ok(deliveries))
            })
            .await
            .unwrap();

        assert_eq!(report.acknowledged, 5);
        assert_eq!(
            batches,
            vec![
                vec!["p1".to_string(), "p2".to_string(), "p3".to_string()],
                vec!["p1".to_string()],
                vec!["p1".to_string()],
            ]
        );
    }
}
