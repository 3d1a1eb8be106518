//! Observable sync status

use tokio::sync::watch;

use crate::state::SyncStatus;

/// Publishes the aggregated [`SyncStatus`] to any number of observers
pub struct SyncStatusReporter {
    status: watch::Sender<SyncStatus>,
}

impl Default for SyncStatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusReporter {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self { status }
    }

    pub fn current(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn set_online(&self, is_online: bool) {
        self.update(|status| {
            status.is_online = is_online;
            if !is_online {
                status.is_syncing = false;
            }
        });
    }

    pub fn set_syncing(&self, is_syncing: bool) {
        self.update(|status| status.is_syncing = is_syncing);
    }

    pub fn set_pending(&self, pending_changes: usize, failed_changes: usize) {
        self.update(|status| {
            status.pending_changes = pending_changes;
            status.failed_changes = failed_changes;
        });
    }

    /// Record a fully successful sync cycle
    pub fn record_success(&self, at: i64) {
        self.update(|status| {
            status.last_sync_time = Some(at);
            status.error = None;
            status.auth_expired = false;
        });
    }

    pub fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|status| status.error = Some(error));
    }

    pub fn set_auth_expired(&self, auth_expired: bool) {
        self.update(|status| {
            status.auth_expired = auth_expired;
            if auth_expired {
                status.error = Some("Authentication expired".to_string());
            } else {
                status.error = None;
            }
        });
    }

    /// Apply a change, notifying observers only if the status actually changed
    fn update(&self, change: impl FnOnce(&mut SyncStatus)) {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            change(status);
            *status != before
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SyncState;

    #[test]
    fn test_offline_clears_syncing() {
        let reporter = SyncStatusReporter::new();
        reporter.set_online(true);
        reporter.set_syncing(true);
        assert_eq!(reporter.current().state(), SyncState::Syncing);

        reporter.set_online(false);
        let status = reporter.current();
        assert!(!status.is_syncing);
        assert_eq!(status.state(), SyncState::Offline);
    }

    #[test]
    fn test_success_clears_error() {
        let reporter = SyncStatusReporter::new();
        reporter.set_online(true);
        reporter.record_error("boom");
        assert_eq!(reporter.current().state(), SyncState::Error);

        reporter.record_success(42);
        let status = reporter.current();
        assert_eq!(status.last_sync_time, Some(42));
        assert_eq!(status.error, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_observers_only_notified_on_change() {
        let reporter = SyncStatusReporter::new();
        let mut receiver = reporter.subscribe();

        reporter.set_pending(0, 0);
        assert!(!receiver.has_changed().unwrap());

        reporter.set_pending(2, 1);
        assert!(receiver.has_changed().unwrap());
        let status = receiver.borrow_and_update().clone();
        assert_eq!(status.pending_changes, 2);
        assert_eq!(status.failed_changes, 1);
    }
}
