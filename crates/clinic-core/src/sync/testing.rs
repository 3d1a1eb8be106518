//! In-memory replication server with fault injection for tests

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::protocol::{PullBatch, PushRequest, PushResponse, PushResult};
use super::transport::{RemoteTransport, TransportError, TransportResult};
use crate::models::{Document, OperationId};

#[derive(Default)]
struct RemoteState {
    documents: HashMap<String, Document>,
    last_revision: i64,
    applied: HashSet<OperationId>,
    effects: usize,
    push_calls: usize,
    unreachable: bool,
    auth_expired: bool,
    failing_pushes: usize,
    lost_acks: usize,
    push_delay: Option<Duration>,
}

/// Central server double.
///
/// Follows the server push rules: replays of an applied operation id are
/// accepted without a new revision, and a base revision that does not match
/// the stored copy is a conflict.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    pub fn set_auth_expired(&self, expired: bool) {
        self.state().auth_expired = expired;
    }

    /// Fail the next `count` pushes before they reach the server
    pub fn fail_next_pushes(&self, count: usize) {
        self.state().failing_pushes = count;
    }

    /// Apply the next `count` pushes but lose their responses
    pub fn lose_next_acks(&self, count: usize) {
        self.state().lost_acks = count;
    }

    /// Write from another device
    pub fn remote_write(&self, mut document: Document) -> Document {
        let mut state = self.state();
        state.last_revision += 1;
        document.revision = state.last_revision;
        state.documents.insert(document.id.clone(), document.clone());
        document
    }

    /// Hold every push for `delay` before it reaches the server
    pub fn delay_pushes(&self, delay: Duration) {
        self.state().push_delay = Some(delay);
    }

    pub fn document(&self, id: &str) -> Option<Document> {
        self.state().documents.get(id).cloned()
    }

    /// Mutations applied, replays excluded
    pub fn effects(&self) -> usize {
        self.state().effects
    }

    pub fn push_calls(&self) -> usize {
        self.state().push_calls
    }

    fn check_access(state: &RemoteState) -> TransportResult<()> {
        if state.unreachable {
            return Err(TransportError::Network("connection refused".to_string()));
        }
        if state.auth_expired {
            return Err(TransportError::AuthExpired);
        }
        Ok(())
    }
}

impl RemoteTransport for MemoryRemote {
    async fn push(&self, request: PushRequest) -> TransportResult<PushResponse> {
        let delay = self.state().push_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        Self::check_access(&state)?;
        state.push_calls += 1;
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(TransportError::Server {
                status: 503,
                message: "unavailable".to_string(),
            });
        }

        let mut results = Vec::with_capacity(request.items.len());
        for item in request.items {
            let id = item.document.id.clone();
            if state.applied.contains(&item.operation_id) {
                if let Some(current) = state.documents.get(&id) {
                    results.push(PushResult::Accepted {
                        operation_id: item.operation_id,
                        document: current.clone(),
                    });
                    continue;
                }
            }

            if let Some(current) = state.documents.get(&id) {
                if item.base_revision != Some(current.revision) {
                    results.push(PushResult::Conflict {
                        operation_id: item.operation_id,
                        current: Some(current.clone()),
                    });
                    continue;
                }
            }

            state.last_revision += 1;
            let mut document = item.document;
            document.revision = state.last_revision;
            state.documents.insert(id, document.clone());
            state.applied.insert(item.operation_id);
            state.effects += 1;
            results.push(PushResult::Accepted {
                operation_id: item.operation_id,
                document,
            });
        }

        if state.lost_acks > 0 {
            state.lost_acks -= 1;
            return Err(TransportError::Network("connection reset".to_string()));
        }
        Ok(PushResponse { results })
    }

    async fn pull(
        &self,
        collection: &str,
        since: Option<&str>,
        limit: usize,
    ) -> TransportResult<PullBatch> {
        let state = self.state();
        Self::check_access(&state)?;
        let since = since.and_then(|cursor| cursor.parse::<i64>().ok()).unwrap_or(0);

        let mut changed: Vec<Document> = state
            .documents
            .values()
            .filter(|doc| doc.collection == collection && doc.revision > since)
            .cloned()
            .collect();
        changed.sort_by_key(|doc| doc.revision);
        let has_more = changed.len() > limit;
        changed.truncate(limit);

        let checkpoint = changed
            .last()
            .map_or_else(|| since.to_string(), |doc| doc.revision.to_string());
        Ok(PullBatch {
            documents: changed,
            checkpoint: Some(checkpoint),
            has_more,
        })
    }

    async fn fetch(&self, _collection: &str, id: &str) -> TransportResult<Option<Document>> {
        let state = self.state();
        Self::check_access(&state)?;
        Ok(state.documents.get(id).cloned())
    }

    async fn ping(&self) -> TransportResult<()> {
        if self.state().unreachable {
            return Err(TransportError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}
