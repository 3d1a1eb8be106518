//! Sync engine: owns the store, queue, monitor and channel

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{Instant, Interval};

use super::channel::{ReplicationChannel, SyncReport};
use super::monitor::{Connectivity, ConnectivityMonitor, NetworkEvent};
use super::pending::PendingWriteQueue;
use super::status::SyncStatusReporter;
use super::transport::RemoteTransport;
use super::SyncError;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::models::{
    now_millis, Document, Fields, NewQueueEntry, OperationId, OperationKind, QueueEntry,
    QueueEntryUpdate, QueueStatus,
};
use crate::state::SyncStatus;
use crate::store::LocalStore;

/// Explicitly constructed replication context.
///
/// Local mutations go through the engine so that each one lands in the
/// store and the pending queue atomically and wakes the background loop.
/// Mutations never wait on the network.
pub struct SyncEngine<T> {
    store: LocalStore,
    queue: PendingWriteQueue,
    monitor: ConnectivityMonitor,
    channel: ReplicationChannel<T>,
    status: SyncStatusReporter,
    sync_interval: Option<Duration>,
    kick: Notify,
    cycle: Mutex<()>,
    halted: AtomicBool,
}

impl<T: RemoteTransport> SyncEngine<T> {
    /// Build an engine; it starts offline until a probe or network event says otherwise
    pub fn new(store: LocalStore, transport: T, config: SyncConfig) -> Self {
        let queue = PendingWriteQueue::new(store.clone(), config.max_attempts);
        let monitor = ConnectivityMonitor::with_failure_threshold(
            Connectivity::Offline,
            config.probe_failure_threshold,
        );
        let sync_interval = config.sync_interval;
        let channel = ReplicationChannel::new(transport, store.clone(), queue.clone(), config);

        Self {
            store,
            queue,
            monitor,
            channel,
            status: SyncStatusReporter::new(),
            sync_interval,
            kick: Notify::new(),
            cycle: Mutex::new(()),
            halted: AtomicBool::new(false),
        }
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn queue(&self) -> &PendingWriteQueue {
        &self.queue
    }

    pub const fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub const fn channel(&self) -> &ReplicationChannel<T> {
        &self.channel
    }

    pub const fn status(&self) -> &SyncStatusReporter {
        &self.status
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    // ==================== Local mutations ====================

    /// Create a document in `collection`
    pub async fn create(&self, collection: &str, fields: Fields) -> Result<Document> {
        let (doc, _) = self
            .store
            .put_tracked(Document::new(collection, fields), OperationKind::Create)
            .await?;
        self.local_write_committed().await?;
        Ok(doc)
    }

    /// Patch a live document; a `null` value removes the field
    pub async fn update(&self, id: &str, patch: Fields) -> Result<Document> {
        let (doc, _) = self.store.patch_tracked(id, patch).await?;
        self.local_write_committed().await?;
        Ok(doc)
    }

    /// Tombstone a document so the deletion replicates
    pub async fn delete(&self, id: &str) -> Result<Document> {
        let (doc, _) = self.store.delete_tracked(id).await?;
        self.local_write_committed().await?;
        Ok(doc)
    }

    /// Put a patient in the queue. The token is final locally as soon as this returns
    pub async fn create_queue_item(&self, entry: NewQueueEntry) -> Result<QueueEntry> {
        let (doc, _) = self.store.create_queue_entry(entry).await?;
        self.local_write_committed().await?;
        QueueEntry::from_document(&doc)
    }

    /// Change an entry's status or triage level
    pub async fn update_queue_entry(&self, id: &str, update: QueueEntryUpdate) -> Result<QueueEntry> {
        let (entry, _) = self.store.update_queue_entry(id, update).await?;
        self.local_write_committed().await?;
        Ok(entry)
    }

    /// Live queue entries in priority order
    pub async fn queue_entries(
        &self,
        queue_date: Option<NaiveDate>,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueEntry>> {
        self.store.queue_entries(queue_date, status).await
    }

    /// Re-arm dead-lettered operations and schedule a push
    pub async fn retry_failed(&self) -> Result<usize> {
        let count = self.queue.retry_failed().await?;
        self.local_write_committed().await?;
        Ok(count)
    }

    /// Drop a queued operation without delivering it
    pub async fn discard(&self, id: &OperationId) -> Result<()> {
        self.queue.discard(id).await?;
        self.refresh_pending().await
    }

    async fn local_write_committed(&self) -> Result<()> {
        self.refresh_pending().await?;
        self.kick.notify_one();
        Ok(())
    }

    /// Recount the pending queue into the published status
    pub async fn refresh_pending(&self) -> Result<()> {
        let pending = self.queue.pending_count().await?;
        let failed = self.queue.failed_count().await?;
        self.status.set_pending(pending, failed);
        Ok(())
    }

    // ==================== Connectivity ====================

    /// Feed a platform network event into the monitor
    pub fn observe_network(&self, event: NetworkEvent) {
        self.monitor.observe(event);
        self.status.set_online(self.monitor.is_online());
    }

    /// Ping the server and record the result; returns whether it answered
    pub async fn probe(&self) -> bool {
        let reachable = match self.channel.transport().ping().await {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!("Probe failed: {error}");
                false
            }
        };
        self.monitor.record_probe(reachable);
        self.status.set_online(self.monitor.is_online());
        reachable
    }

    // ==================== Replication ====================

    /// Run one push + pull cycle now.
    ///
    /// Cycles never overlap. Going offline mid-cycle cancels the in-flight
    /// request and leaves its operations queued untouched.
    pub async fn sync_now(&self) -> std::result::Result<SyncReport, SyncError> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(SyncError::AuthExpired);
        }
        if !self.monitor.is_online() {
            return Err(SyncError::Offline);
        }

        let _cycle = self.cycle.lock().await;
        self.status.set_syncing(true);
        let result = tokio::select! {
            result = self.channel.sync_cycle() => result,
            () = self.monitor.wait_offline() => Err(SyncError::Cancelled),
        };
        self.status.set_syncing(false);

        match &result {
            Ok(report) => {
                self.status.record_success(now_millis());
                if report.pushed.dead_lettered > 0 {
                    self.status.record_error(format!(
                        "{} operations failed permanently",
                        report.pushed.dead_lettered
                    ));
                }
            }
            Err(SyncError::AuthExpired) => {
                tracing::warn!("Authentication expired; replication halted until re-authentication");
                self.halted.store(true, Ordering::SeqCst);
                self.status.set_auth_expired(true);
            }
            Err(SyncError::Cancelled) => tracing::info!("Sync cancelled: connectivity lost"),
            Err(error) => self.status.record_error(error.to_string()),
        }

        self.refresh_pending().await?;
        result
    }

    /// Resume replication after the session was renewed
    pub fn resume_after_reauth(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            tracing::info!("Replication resumed after re-authentication");
        }
        self.status.set_auth_expired(false);
        self.kick.notify_one();
    }

    /// Background loop until `shutdown` resolves.
    ///
    /// Syncs on connectivity regained, after local writes, and on every
    /// automatic interval tick (preceded by a probe).
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut connectivity = self.monitor.subscribe();
        let mut ticker = self
            .sync_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        if let Err(error) = self.refresh_pending().await {
            tracing::warn!("Failed to count pending operations: {error}");
        }
        self.probe().await;
        self.sync_logged().await;

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connectivity.borrow_and_update();
                    if state == Connectivity::Online {
                        self.sync_logged().await;
                    }
                }
                () = self.kick.notified() => self.sync_logged().await,
                () = tick(ticker.as_mut()) => {
                    self.probe().await;
                    self.sync_logged().await;
                }
            }
        }
        tracing::info!("Sync engine stopped");
    }

    async fn sync_logged(&self) {
        match self.sync_now().await {
            Ok(_) | Err(SyncError::Offline | SyncError::Cancelled) => {}
            Err(SyncError::AuthExpired) => tracing::debug!("Sync skipped: authentication expired"),
            Err(error) => tracing::warn!("Sync cycle failed: {error}"),
        }
    }
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
