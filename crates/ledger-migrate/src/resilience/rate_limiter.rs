//! Token bucket rate limiting for source API calls.
//!
//! [`RateLimiter`] refills lazily: tokens are credited for the time elapsed
//! since the last refill whenever the bucket is inspected. A single mutex
//! guards the bucket, so concurrent workers never observe partial state.
//!
//! [`AdaptiveRateLimiter`] adjusts the refill rate from API feedback:
//! sustained success raises it, throttling responses cut it and may pin the
//! bucket empty until the server's `Retry-After` time.

use crate::config::RateLimitConfig;
use crate::core::header_value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Interval between availability checks while waiting for tokens.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Rate increase after a run of successful calls.
const INCREASE_FACTOR: f64 = 1.1;

/// Rate decrease on a throttling response.
const DECREASE_FACTOR: f64 = 0.5;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    /// No refill happens before this instant (server-imposed back-off).
    pinned_until: Option<Instant>,
    consecutive_successes: u32,
}

impl Bucket {
    fn refill(&mut self, now: Instant, max_tokens: f64, period: Duration) {
        if let Some(until) = self.pinned_until {
            if now < until {
                return;
            }
            self.pinned_until = None;
            self.last_refill = until;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = elapsed.as_secs_f64() / period.as_secs_f64() * self.refill_rate;
        self.tokens = (self.tokens + added).min(max_tokens);
        self.last_refill = now;
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub name: String,
    pub tokens: f64,
    pub max_tokens: u32,
    pub refill_rate: f64,
    pub refill_period_ms: u64,
    pub consecutive_successes: u32,
    /// Remaining server-imposed pause, if any.
    pub pinned_for_ms: Option<u64>,
}

/// Token bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    max_tokens: u32,
    refill_period: Duration,
    default_timeout: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(name: impl Into<String>, config: &RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            max_tokens: config.max_tokens,
            refill_period: config.refill_period(),
            default_timeout: config.acquire_timeout(),
            bucket: Mutex::new(Bucket {
                tokens: config.max_tokens as f64,
                refill_rate: config.refill_rate,
                last_refill: Instant::now(),
                pinned_until: None,
                consecutive_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Take `n` tokens.
    ///
    /// Without `wait`, fails immediately when the bucket is short. With
    /// `wait`, polls every 100ms until the tokens are available or the
    /// timeout (default from config) elapses. Requests larger than the
    /// bucket can never succeed and fail immediately.
    pub async fn acquire(&self, n: u32, wait: bool, timeout: Option<Duration>) -> bool {
        if n > self.max_tokens {
            debug!(
                "{}: requested {} tokens exceeds capacity {}",
                self.name, n, self.max_tokens
            );
            return false;
        }

        let needed = n as f64;
        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);

        loop {
            {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(Instant::now(), self.max_tokens as f64, self.refill_period);
                if bucket.tokens >= needed {
                    bucket.tokens -= needed;
                    return true;
                }
            }

            let now = Instant::now();
            if !wait || now >= deadline {
                if wait {
                    warn!("{}: timed out waiting for {} tokens", self.name, n);
                }
                return false;
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Tokens currently available (after refill).
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), self.max_tokens as f64, self.refill_period);
        bucket.tokens
    }

    /// Current refill rate per period.
    pub async fn refill_rate(&self) -> f64 {
        self.bucket.lock().await.refill_rate
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        bucket.refill(now, self.max_tokens as f64, self.refill_period);
        RateLimiterSnapshot {
            name: self.name.clone(),
            tokens: bucket.tokens,
            max_tokens: self.max_tokens,
            refill_rate: bucket.refill_rate,
            refill_period_ms: self.refill_period.as_millis() as u64,
            consecutive_successes: bucket.consecutive_successes,
            pinned_for_ms: bucket
                .pinned_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// Token bucket whose refill rate follows API feedback.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    limiter: RateLimiter,
    success_threshold: u32,
    min_rate: f64,
    max_rate: f64,
}

impl AdaptiveRateLimiter {
    pub fn new(name: impl Into<String>, config: &RateLimitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(name, config),
            success_threshold: config.adaptive_success_threshold.max(1),
            min_rate: config.min_refill_rate,
            max_rate: config.max_refill_rate,
        }
    }

    /// See [`RateLimiter::acquire`].
    pub async fn acquire(&self, n: u32, wait: bool, timeout: Option<Duration>) -> bool {
        self.limiter.acquire(n, wait, timeout).await
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Count a successful call; every `success_threshold` in a row raises
    /// the refill rate by 10%, up to the configured maximum.
    pub async fn record_success(&self) {
        let mut bucket = self.limiter.bucket.lock().await;
        bucket.consecutive_successes += 1;
        if bucket.consecutive_successes >= self.success_threshold {
            bucket.refill(
                Instant::now(),
                self.limiter.max_tokens as f64,
                self.limiter.refill_period,
            );
            let old = bucket.refill_rate;
            bucket.refill_rate = (old * INCREASE_FACTOR).min(self.max_rate);
            bucket.consecutive_successes = 0;
            if bucket.refill_rate > old {
                info!(
                    "{}: raising refill rate {:.2} -> {:.2}",
                    self.limiter.name, old, bucket.refill_rate
                );
            }
        }
    }

    /// React to a throttling response: halve the refill rate (floored at
    /// the configured minimum) and, when the server says how long to wait,
    /// empty the bucket and suspend refill until then.
    pub async fn record_rate_limited(&self, retry_after: Option<Duration>) {
        let mut bucket = self.limiter.bucket.lock().await;
        let now = Instant::now();
        bucket.refill(now, self.limiter.max_tokens as f64, self.limiter.refill_period);

        let old = bucket.refill_rate;
        bucket.refill_rate = (old * DECREASE_FACTOR).max(self.min_rate);
        bucket.consecutive_successes = 0;

        if let Some(delay) = retry_after {
            bucket.tokens = 0.0;
            bucket.pinned_until = Some(now + delay);
        }

        warn!(
            "{}: rate limited, refill rate {:.2} -> {:.2}{}",
            self.limiter.name,
            old,
            bucket.refill_rate,
            retry_after
                .map(|d| format!(", paused for {:?}", d))
                .unwrap_or_default()
        );
    }

    /// Drop all tokens without changing the rate (remaining-count header hit 0).
    pub async fn drain(&self) {
        let mut bucket = self.limiter.bucket.lock().await;
        bucket.refill(
            Instant::now(),
            self.limiter.max_tokens as f64,
            self.limiter.refill_period,
        );
        bucket.tokens = 0.0;
        debug!("{}: server reports no remaining quota", self.limiter.name);
    }

    /// Feed an API response into the limiter.
    ///
    /// 429 is a throttling signal; 2xx counts as success. A 2xx with
    /// `X-RateLimit-Remaining: 0` drains the bucket.
    pub async fn on_response(&self, status: u16, headers: &HashMap<String, String>) {
        match status {
            429 => {
                let retry_after = header_value(headers, "retry-after").and_then(parse_retry_after);
                self.record_rate_limited(retry_after).await;
            }
            200..=299 => {
                self.record_success().await;
                let exhausted = header_value(headers, "x-ratelimit-remaining")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    == Some(0);
                if exhausted {
                    self.drain().await;
                }
            }
            _ => {}
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        self.limiter.snapshot().await
    }
}

/// Parse a `Retry-After` value: delay in seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    DateTime::parse_from_rfc2822(value).ok().map(|at| {
        let delta = at.with_timezone(&Utc) - Utc::now();
        delta.to_std().unwrap_or(Duration::ZERO)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_tokens: u32, refill_rate: f64) -> RateLimitConfig {
        RateLimitConfig {
            max_tokens,
            refill_rate,
            refill_period_ms: 1000,
            acquire_timeout_secs: 5,
            adaptive_success_threshold: 3,
            min_refill_rate: 1.0,
            max_refill_rate: 12.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_exhausted() {
        let limiter = RateLimiter::new("api", &config(20, 10.0));
        for i in 0..20 {
            assert!(limiter.acquire(1, false, None).await, "acquire {} failed", i);
        }
        assert!(!limiter.acquire(1, false, None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_above_capacity_never_succeeds() {
        let limiter = RateLimiter::new("api", &config(5, 10.0));
        assert!(!limiter.acquire(6, false, None).await);
        assert!(
            !limiter
                .acquire(6, true, Some(Duration::from_secs(10)))
                .await
        );
        assert_eq!(limiter.available_tokens().await, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_one_period() {
        let limiter = RateLimiter::new("api", &config(20, 10.0));
        assert!(limiter.acquire(20, false, None).await);
        assert_eq!(limiter.available_tokens().await, 0.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.available_tokens().await, 10.0);

        // Capped at capacity
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.available_tokens().await, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tokens() {
        let limiter = RateLimiter::new("api", &config(2, 10.0));
        assert!(limiter.acquire(2, false, None).await);

        let start = Instant::now();
        assert!(
            limiter
                .acquire(1, true, Some(Duration::from_secs(1)))
                .await
        );
        // One token needs 100ms at 10/s
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let limiter = RateLimiter::new("api", &config(2, 1.0));
        assert!(limiter.acquire(2, false, None).await);
        assert!(
            !limiter
                .acquire(2, true, Some(Duration::from_millis(500)))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_increase_is_capped() {
        let limiter = AdaptiveRateLimiter::new("api", &config(20, 10.0));
        for _ in 0..3 {
            limiter.record_success().await;
        }
        assert!((limiter.limiter().refill_rate().await - 11.0).abs() < 1e-9);

        for _ in 0..30 {
            limiter.record_success().await;
        }
        assert_eq!(limiter.limiter().refill_rate().await, 12.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_halves_rate_with_floor() {
        let limiter = AdaptiveRateLimiter::new("api", &config(20, 10.0));
        limiter.record_rate_limited(None).await;
        assert_eq!(limiter.limiter().refill_rate().await, 5.0);

        for _ in 0..5 {
            limiter.record_rate_limited(None).await;
        }
        assert_eq!(limiter.limiter().refill_rate().await, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_pins_bucket() {
        let limiter = AdaptiveRateLimiter::new("api", &config(20, 10.0));
        let mut headers = HashMap::new();
        headers.insert("Retry-After".to_string(), "2".to_string());
        limiter.on_response(429, &headers).await;

        assert_eq!(limiter.limiter().available_tokens().await, 0.0);
        tokio::time::advance(Duration::from_millis(1900)).await;
        assert!(!limiter.acquire(1, false, None).await);

        // Pin released; refills at the halved rate (5/s) from the pin time
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.acquire(1, false, None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_zero_drains_without_rate_change() {
        let limiter = AdaptiveRateLimiter::new("api", &config(20, 10.0));
        let mut headers = HashMap::new();
        headers.insert("x-ratelimit-remaining".to_string(), "0".to_string());
        limiter.on_response(200, &headers).await;

        assert_eq!(limiter.limiter().available_tokens().await, 0.0);
        assert_eq!(limiter.limiter().refill_rate().await, 10.0);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }
}
