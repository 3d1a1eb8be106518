//! Shared sync status types.

use serde::{Deserialize, Serialize};

/// Coarse sync state for compact indicators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

/// Observable sync status for display.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    /// Operations not yet acknowledged by the server (including dead-lettered ones)
    pub pending_changes: usize,
    /// Dead-lettered operations awaiting a retry or discard
    #[serde(default)]
    pub failed_changes: usize,
    /// Last fully successful sync cycle (Unix ms)
    pub last_sync_time: Option<i64>,
    pub error: Option<String>,
    /// Replication halted until the session is renewed
    #[serde(default)]
    pub auth_expired: bool,
}

impl SyncStatus {
    pub const fn state(&self) -> SyncState {
        if !self.is_online {
            SyncState::Offline
        } else if self.is_syncing {
            SyncState::Syncing
        } else if self.error.is_some() || self.auth_expired {
            SyncState::Error
        } else {
            SyncState::Synced
        }
    }
}
