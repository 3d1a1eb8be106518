//! Replication between the local store and the central server.
//!
//! The pieces compose leaf-first: [`PendingWriteQueue`] holds unacknowledged
//! writes, [`ConnectivityMonitor`] tracks reachability, [`ReplicationChannel`]
//! pushes and pulls batches over a [`RemoteTransport`], and [`SyncEngine`]
//! owns all of them and publishes a [`SyncStatus`](crate::state::SyncStatus)
//! through [`SyncStatusReporter`].

mod channel;
mod engine;
mod http;
mod monitor;
mod pending;
mod protocol;
mod retry;
mod status;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

use thiserror::Error;

pub use channel::{ReplicationChannel, SyncReport};
pub use engine::SyncEngine;
pub use http::{Credentials, HttpTransport};
pub use monitor::{Connectivity, ConnectivityMonitor, NetworkEvent, DEFAULT_PROBE_FAILURE_THRESHOLD};
pub use pending::{Delivery, DrainReport, DrainStop, PendingWriteQueue, DEFAULT_MAX_ATTEMPTS};
pub use protocol::{PullBatch, PushItem, PushRequest, PushResponse, PushResult, MAX_PUSH_BATCH};
pub use retry::RetryPolicy;
pub use status::SyncStatusReporter;
pub use transport::{RemoteTransport, TransportError, TransportResult};

/// Failure of a sync cycle
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient network failure; retried on the next cycle
    #[error("Network error: {0}")]
    Network(String),
    /// The session must be renewed before replication resumes
    #[error("Authentication expired")]
    AuthExpired,
    /// Connectivity was lost mid-cycle
    #[error("Sync cancelled")]
    Cancelled,
    #[error("Offline")]
    Offline,
    #[error("Sync is not configured: {0}")]
    NotConfigured(String),
    #[error(transparent)]
    Store(#[from] crate::Error),
    /// The server refused a request or answered with something unreadable
    #[error("Remote error: {0}")]
    Remote(String),
}

impl From<TransportError> for SyncError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Network(_) | TransportError::Server { .. } => {
                Self::Network(error.to_string())
            }
            TransportError::AuthExpired => Self::AuthExpired,
            TransportError::Rejected(message) | TransportError::Decode(message) => {
                Self::Remote(message)
            }
        }
    }
}
