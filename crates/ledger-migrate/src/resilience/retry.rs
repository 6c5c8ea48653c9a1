//! Exponential backoff for transient failures.

use crate::config::RetryConfig;
use crate::error::{MigrateError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `max_attempts` is exhausted. A `Retry-After` hint lengthens the wait.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let mut delay = config.backoff(attempt);
                if let MigrateError::RateLimitExceeded {
                    retry_after_secs: Some(secs),
                } = &e
                {
                    delay = delay.max(Duration::from_secs(*secs));
                }
                warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    label, attempt, config.max_attempts, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
