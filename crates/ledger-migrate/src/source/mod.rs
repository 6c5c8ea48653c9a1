//! Source API access.
//!
//! [`ResilientSource`] wraps any [`SourceApi`] with the endpoint's rate
//! limiter and circuit breaker, retries transient failures with backoff and
//! records every call in the audit trail.

mod file;

pub use file::FileSource;

use crate::audit::AuditTrail;
use crate::config::RetryConfig;
use crate::core::{ApiResponse, ExternalRecord, SourceApi};
use crate::error::{MigrateError, Result};
use crate::resilience::{parse_retry_after, retry_with_backoff, EndpointGuard, ResilienceRegistry};
use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Throttled, retrying client over a [`SourceApi`].
pub struct ResilientSource {
    api: Arc<dyn SourceApi>,
    guard: Arc<EndpointGuard>,
    retry: RetryConfig,
    acquire_timeout: Duration,
    audit: Option<Arc<AuditTrail>>,
}

impl ResilientSource {
    pub fn new(api: Arc<dyn SourceApi>, registry: &ResilienceRegistry) -> Self {
        let guard = registry.guard(api.endpoint());
        Self {
            api,
            guard,
            retry: registry.config().retry.clone(),
            acquire_timeout: registry.config().rate_limit.acquire_timeout(),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn endpoint(&self) -> &str {
        self.api.endpoint()
    }

    /// Maximum records one call returns.
    pub fn record_limit(&self) -> usize {
        self.api.record_limit()
    }

    pub fn guard(&self) -> &EndpointGuard {
        &self.guard
    }

    /// Fetch records posted within `[from, to]`, retrying transient failures.
    pub async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<ExternalRecord>> {
        let label = format!("fetch {}..{}", from, to);
        retry_with_backoff(&self.retry, &label, || self.fetch_once(from, to)).await
    }

    async fn fetch_once(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<ExternalRecord>> {
        if !self
            .guard
            .limiter
            .acquire(1, true, Some(self.acquire_timeout))
            .await
        {
            return Err(MigrateError::RateLimitExceeded {
                retry_after_secs: None,
            });
        }

        let started = Instant::now();
        let result = self
            .guard
            .breaker
            .call(|| async {
                let response = self.api.fetch(from, to).await?;
                self.guard
                    .limiter
                    .on_response(response.status, &response.headers)
                    .await;
                interpret(response)
            })
            .await;

        let elapsed = started.elapsed();
        debug!(
            "{}: fetch {}..{} finished in {:?}",
            self.api.endpoint(),
            from,
            to,
            elapsed
        );

        if let Some(audit) = &self.audit {
            let params = json!({ "from": from, "to": to });
            match &result {
                Ok(records) => audit.log_api_call(
                    self.api.endpoint(),
                    "GET",
                    json!({ "from": from, "to": to, "returned": records.len() }),
                    Some(200),
                    elapsed,
                    None,
                ),
                Err(e) => audit.log_api_call(
                    self.api.endpoint(),
                    "GET",
                    params,
                    status_of(e),
                    elapsed,
                    Some(&e.to_string()),
                ),
            }
        }

        result
    }
}

/// Map a raw response to records or a classified error.
fn interpret(response: ApiResponse) -> Result<Vec<ExternalRecord>> {
    match response.status {
        200..=299 => Ok(response.records),
        429 => Err(MigrateError::RateLimitExceeded {
            retry_after_secs: response
                .header("retry-after")
                .and_then(parse_retry_after)
                .map(|d| d.as_secs().max(1)),
        }),
        500..=599 => Err(MigrateError::TransientNetwork(format!(
            "HTTP {}",
            response.status
        ))),
        status => Err(MigrateError::Source(format!("HTTP {}", status))),
    }
}

fn status_of(e: &MigrateError) -> Option<u16> {
    match e {
        MigrateError::RateLimitExceeded { .. } => Some(429),
        MigrateError::TransientNetwork(msg) | MigrateError::Source(msg) => msg
            .strip_prefix("HTTP ")
            .and_then(|code| code.parse().ok()),
        _ => None,
    }
}
