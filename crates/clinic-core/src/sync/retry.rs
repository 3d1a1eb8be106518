//! Backoff policy for transient transport failures

use std::future::Future;
use std::time::Duration;

use super::transport::TransportResult;

/// Exponential backoff schedule.
///
/// Failures are returned as values once the budget is spent; nothing is
/// retried in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per request, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `request`, retrying transient failures with backoff
    pub async fn run<T, F, Fut>(&self, what: &str, mut request: F) -> TransportResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let mut retry = 0;
        loop {
            match request().await {
                Err(error) if error.is_transient() && retry + 1 < self.max_attempts => {
                    let delay = self.delay_for(retry);
                    tracing::warn!("{what} failed ({error}); retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                result => return result,
            }
        }
    }
}
