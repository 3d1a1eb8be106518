//! Live query subscriptions

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use super::{LocalStore, Query};
use crate::error::{Error, Result};
use crate::models::Document;

/// Pending change notifications per subscriber; extra changes coalesce
const EVENT_CAPACITY: usize = 16;

/// Registered change listeners
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    next_id: AtomicU64,
    senders: Mutex<HashMap<u64, mpsc::Sender<()>>>,
}

impl SubscriberRegistry {
    fn register(&self) -> (u64, mpsc::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(EVENT_CAPACITY);
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        (id, receiver)
    }

    fn unregister(&self, id: u64) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Signal every subscriber that the store changed
    pub(crate) fn notify_all(&self) {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        for sender in senders.values() {
            // A full channel already holds a pending refresh
            let _ = sender.try_send(());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Live sequence of result-set snapshots for a query.
///
/// The first call to [`Subscription::next`] yields the current snapshot;
/// later calls wait until a mutation changes the result set. Dropping or
/// disposing the subscription unregisters it.
pub struct Subscription {
    id: u64,
    query: Query,
    store: LocalStore,
    events: mpsc::Receiver<()>,
    last: Option<Vec<Document>>,
}

impl Subscription {
    pub(super) fn new(store: LocalStore, query: Query) -> Self {
        let (id, events) = store.subscribers.register();
        Self {
            id,
            query,
            store,
            events,
            last: None,
        }
    }

    /// Next snapshot of the result set
    pub async fn next(&mut self) -> Result<Vec<Document>> {
        if self.last.is_none() {
            return self.refresh().await;
        }

        loop {
            if self.events.recv().await.is_none() {
                return Err(Error::Database("subscription closed".to_string()));
            }
            while self.events.try_recv().is_ok() {}

            let snapshot = self.store.query(&self.query).await?;
            if self.last.as_ref() != Some(&snapshot) {
                self.last = Some(snapshot.clone());
                return Ok(snapshot);
            }
        }
    }

    /// Most recently delivered snapshot
    pub fn current(&self) -> Option<&[Document]> {
        self.last.as_deref()
    }

    /// Unregister from the store
    pub fn dispose(self) {}

    async fn refresh(&mut self) -> Result<Vec<Document>> {
        let snapshot = self.store.query(&self.query).await?;
        self.last = Some(snapshot.clone());
        Ok(snapshot)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.subscribers.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fields;
    use std::time::Duration;

    fn patient(name: &str) -> Document {
        Document::new("patients", Fields::new()).set("name", name)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_snapshot_then_changes() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put(patient("Ada")).await.unwrap();

        let mut subscription = store.subscribe(Query::collection("patients"));
        assert_eq!(subscription.next().await.unwrap().len(), 1);

        store.put(patient("Bo")).await.unwrap();
        let snapshot = subscription.next().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(subscription.current().map(<[Document]>::len), Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_irrelevant_mutations_do_not_emit() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut subscription = store.subscribe(Query::collection("patients"));
        assert!(subscription.next().await.unwrap().is_empty());

        let doctor = Document::new("doctors", Fields::new()).set("name", "Dr. Who");
        store.put(doctor).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(50), subscription.next()).await;
        assert!(waited.is_err(), "doctor write must not refresh a patients subscription");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resubscribe_replays_current_snapshot() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put(patient("Ada")).await.unwrap();

        let mut first = store.subscribe(Query::collection("patients"));
        let snapshot = first.next().await.unwrap();
        first.dispose();

        let mut second = store.subscribe(Query::collection("patients"));
        assert_eq!(second.next().await.unwrap(), snapshot);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bursts_coalesce_into_latest_snapshot() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut subscription = store.subscribe(Query::collection("patients"));
        subscription.next().await.unwrap();

        for i in 0..40 {
            store.put(patient(&format!("P{i}"))).await.unwrap();
        }
        assert_eq!(subscription.next().await.unwrap().len(), 40);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispose_unregisters() {
        let store = LocalStore::open_in_memory().unwrap();
        let subscription = store.subscribe(Query::all());
        let other = store.subscribe(Query::all());
        assert_eq!(store.subscribers.len(), 2);

        subscription.dispose();
        assert_eq!(store.subscribers.len(), 1);
        drop(other);
        assert_eq!(store.subscribers.len(), 0);
    }
}
