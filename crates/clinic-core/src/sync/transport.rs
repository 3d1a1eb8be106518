//! Remote side of replication

use std::future::Future;

use thiserror::Error;

use super::protocol::{PullBatch, PushRequest, PushResponse};
use crate::models::Document;

/// Failure talking to the central server
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failure or timeout
    #[error("Network error: {0}")]
    Network(String),
    /// 5xx-equivalent response
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// 401-equivalent response; the session must be renewed
    #[error("Authentication expired")]
    AuthExpired,
    /// Request refused as invalid; retrying unchanged will not help
    #[error("Request rejected: {0}")]
    Rejected(String),
    /// Response body could not be decoded
    #[error("Invalid server response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the request may succeed if retried after a delay
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server { .. })
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Replication server as seen by the client
pub trait RemoteTransport: Send + Sync {
    /// Deliver a batch of mutations
    fn push(
        &self,
        request: PushRequest,
    ) -> impl Future<Output = TransportResult<PushResponse>> + Send;

    /// Read the changes feed of a collection after `since`
    fn pull(
        &self,
        collection: &str,
        since: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = TransportResult<PullBatch>> + Send;

    /// Current server copy of a document
    fn fetch(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = TransportResult<Option<Document>>> + Send;

    /// Cheap reachability check
    fn ping(&self) -> impl Future<Output = TransportResult<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Network("reset".into()).is_transient());
        assert!(TransportError::Server {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(!TransportError::AuthExpired.is_transient());
        assert!(!TransportError::Rejected("bad".into()).is_transient());
        assert!(!TransportError::Decode("eof".into()).is_transient());
    }
}
