//! Sync engine configuration.
//!
//! `SyncConfig` is built either with the builder methods or from
//! `CLINIC_SYNC_*` environment variables. Without a server URL the engine
//! runs local-only: every write still lands in the store and the pending
//! queue, ready to replicate once a server is configured.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::conflict::ConflictStrategy;
use crate::schema::SchemaRegistry;
use crate::sync::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_PROBE_FAILURE_THRESHOLD, MAX_PUSH_BATCH};

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_PULL_BATCH_SIZE: usize = 200;

/// Invalid sync configuration value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} must include http:// or https://")]
    InvalidUrl { key: &'static str },
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Replication settings for the sync engine
#[derive(Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL of the central server; `None` runs local-only
    pub server_url: Option<String>,
    /// Bearer token for the central server
    pub auth_token: Option<String>,
    /// Automatic sync period; `None` only syncs on demand and on reconnect
    pub sync_interval: Option<Duration>,
    /// Operations per push request (1..=100)
    pub push_batch_size: usize,
    /// Documents per changes-feed page
    pub pull_batch_size: usize,
    pub strategy: ConflictStrategy,
    /// Backoff for transient transport failures
    pub retry: RetryPolicy,
    /// Rejections an operation may accumulate before it is dead-lettered
    pub max_attempts: u32,
    /// Consecutive failed probes before the monitor goes offline
    pub probe_failure_threshold: u32,
    /// Collections pulled from the server
    pub collections: Vec<String>,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("server_url", &self.server_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("sync_interval", &self.sync_interval)
            .field("push_batch_size", &self.push_batch_size)
            .field("pull_batch_size", &self.pull_batch_size)
            .field("strategy", &self.strategy)
            .field("retry", &self.retry)
            .field("max_attempts", &self.max_attempts)
            .field("probe_failure_threshold", &self.probe_failure_threshold)
            .field("collections", &self.collections)
            .finish()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            auth_token: None,
            sync_interval: Some(Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS)),
            push_batch_size: MAX_PUSH_BATCH,
            pull_batch_size: DEFAULT_PULL_BATCH_SIZE,
            strategy: ConflictStrategy::LastWriteWins,
            retry: RetryPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            probe_failure_threshold: DEFAULT_PROBE_FAILURE_THRESHOLD,
            collections: SchemaRegistry::clinic().collections(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read configuration from `CLINIC_SYNC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| setting(lookup(key));
        let mut config = Self::default();

        if let Some(url) = value("CLINIC_SYNC_URL") {
            config = config.with_server(url, value("CLINIC_SYNC_TOKEN"))?;
        }
        if let Some(raw) = value("CLINIC_SYNC_INTERVAL_SECS") {
            let secs = parse_number::<u64>("CLINIC_SYNC_INTERVAL_SECS", &raw)?;
            config = if secs == 0 {
                config.without_auto_sync()
            } else {
                config.with_sync_interval(Duration::from_secs(secs))
            };
        }
        if let Some(raw) = value("CLINIC_SYNC_BATCH_SIZE") {
            config = config.with_batch_size(parse_number("CLINIC_SYNC_BATCH_SIZE", &raw)?);
        }
        if let Some(raw) = value("CLINIC_SYNC_MAX_ATTEMPTS") {
            config = config.with_max_attempts(parse_number("CLINIC_SYNC_MAX_ATTEMPTS", &raw)?);
        }
        if let Some(raw) = value("CLINIC_SYNC_STRATEGY") {
            let strategy = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "CLINIC_SYNC_STRATEGY",
                value: raw.clone(),
            })?;
            config = config.with_strategy(strategy);
        }

        Ok(config)
    }

    /// Point the engine at a central server
    pub fn with_server(
        mut self,
        url: impl Into<String>,
        auth_token: Option<String>,
    ) -> Result<Self, ConfigError> {
        let url = normalize_server_url(&url.into()).ok_or(ConfigError::InvalidUrl {
            key: "CLINIC_SYNC_URL",
        })?;
        self.server_url = Some(url);
        self.auth_token = setting(auth_token);
        Ok(self)
    }

    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    /// Push batch size, clamped to 1..=100
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.push_batch_size = batch_size.clamp(1, MAX_PUSH_BATCH);
        self
    }

    #[must_use]
    pub fn with_pull_batch_size(mut self, batch_size: usize) -> Self {
        self.pull_batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_probe_failure_threshold(mut self, threshold: u32) -> Self {
        self.probe_failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    pub const fn is_remote_configured(&self) -> bool {
        self.server_url.is_some()
    }
}

/// Trimmed setting value; blank counts as unset
pub fn setting(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Canonical server base URL: trimmed, http(s) with a host, no trailing slash
pub fn normalize_server_url(raw: &str) -> Option<String> {
    let url = raw.trim().trim_end_matches('/');
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return None;
    }
    Some(url.to_string())
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_local_only() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert!(!config.is_remote_configured());
        assert_eq!(config.sync_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.push_batch_size, 100);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.strategy, ConflictStrategy::LastWriteWins);
        assert!(config.collections.contains(&"queue".to_string()));
    }

    #[test]
    fn reads_environment_values() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("CLINIC_SYNC_URL", " https://sync.example.com/ "),
            ("CLINIC_SYNC_TOKEN", "secret"),
            ("CLINIC_SYNC_INTERVAL_SECS", "0"),
            ("CLINIC_SYNC_BATCH_SIZE", "500"),
            ("CLINIC_SYNC_MAX_ATTEMPTS", "3"),
            ("CLINIC_SYNC_STRATEGY", "merge"),
        ]))
        .unwrap();

        assert_eq!(config.server_url.as_deref(), Some("https://sync.example.com"));
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.sync_interval, None);
        assert_eq!(config.push_batch_size, 100);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.strategy, ConflictStrategy::Merge);
    }

    #[test]
    fn rejects_invalid_values() {
        assert_eq!(
            SyncConfig::from_lookup(lookup(&[("CLINIC_SYNC_URL", "sync.example.com")])),
            Err(ConfigError::InvalidUrl {
                key: "CLINIC_SYNC_URL"
            })
        );
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("CLINIC_SYNC_BATCH_SIZE", "lots")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("CLINIC_SYNC_STRATEGY", "newest")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn debug_redacts_token() {
        let config = SyncConfig::new()
            .with_server("https://sync.example.com", Some("secret".to_string()))
            .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn server_urls_are_canonicalized() {
        assert_eq!(
            normalize_server_url(" https://sync.example.com/ ").as_deref(),
            Some("https://sync.example.com")
        );
        assert_eq!(
            normalize_server_url("http://127.0.0.1:8080").as_deref(),
            Some("http://127.0.0.1:8080")
        );
        assert_eq!(normalize_server_url("https://"), None);
        assert_eq!(normalize_server_url("ftp://sync.example.com"), None);
        assert_eq!(normalize_server_url("https://sync example.com"), None);
    }

    #[test]
    fn blank_settings_are_unset() {
        assert_eq!(setting(None), None);
        assert_eq!(setting(Some("  ".to_string())), None);
        assert_eq!(setting(Some(" secret ".to_string())).as_deref(), Some("secret"));
    }

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(SyncConfig::new().with_batch_size(0).push_batch_size, 1);
        assert_eq!(SyncConfig::new().with_batch_size(42).push_batch_size, 42);
    }
}
