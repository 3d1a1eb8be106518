//! Network reachability state machine

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Default number of consecutive failed probes before going offline
pub const DEFAULT_PROBE_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Network change reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Up,
    Down,
}

/// Two-state Online/Offline monitor.
///
/// Platform events switch state immediately. Probe results only take the
/// monitor offline after several consecutive failures, so a single failed
/// request never flips it.
pub struct ConnectivityMonitor {
    state: watch::Sender<Connectivity>,
    probe_failures: AtomicU32,
    failure_threshold: u32,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        Self::with_failure_threshold(initial, DEFAULT_PROBE_FAILURE_THRESHOLD)
    }

    pub fn with_failure_threshold(initial: Connectivity, failure_threshold: u32) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            probe_failures: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn state(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == Connectivity::Online
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Apply an observed network event; returns whether the state changed
    pub fn observe(&self, event: NetworkEvent) -> bool {
        self.probe_failures.store(0, Ordering::SeqCst);
        let next = match event {
            NetworkEvent::Up => Connectivity::Online,
            NetworkEvent::Down => Connectivity::Offline,
        };
        self.transition(next)
    }

    /// Record a reachability probe; returns whether the state changed
    pub fn record_probe(&self, reachable: bool) -> bool {
        if reachable {
            self.probe_failures.store(0, Ordering::SeqCst);
            return self.transition(Connectivity::Online);
        }

        let failures = self.probe_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.failure_threshold {
            self.transition(Connectivity::Offline)
        } else {
            tracing::debug!("Probe failed ({failures}/{})", self.failure_threshold);
            false
        }
    }

    /// Resolves once the monitor is offline
    pub async fn wait_offline(&self) {
        let mut receiver = self.subscribe();
        // The sender lives as long as `self`
        let _ = receiver
            .wait_for(|state| *state == Connectivity::Offline)
            .await;
    }

    fn transition(&self, next: Connectivity) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::info!("Connectivity changed to {next:?}");
        }
        changed
    }
}
