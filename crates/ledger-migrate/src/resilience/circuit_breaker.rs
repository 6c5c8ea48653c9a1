//! Circuit breaker protecting the source API.
//!
//! State machine transitions:
//! - Closed -> Open: `failure_threshold` consecutive failures
//! - Open -> HalfOpen: first call after `recovery_timeout` since the last failure
//! - HalfOpen -> Open: any failure
//! - HalfOpen -> Closed: `success_threshold` successes

use crate::config::CircuitBreakerConfig;
use crate::error::{MigrateError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, calls allowed.
    Closed,
    /// Failing fast, calls rejected.
    Open,
    /// Probing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// A failure remembered for observability.
#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub recent_errors: Vec<RecentError>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
    recent_errors: VecDeque<RecentError>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_failure_at: None,
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
            recent_errors: VecDeque::new(),
        }
    }
}

/// Three-state circuit breaker guarded by a single mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Admit or reject a call. An open circuit whose recovery timeout has
    /// elapsed moves to half-open and admits the call as a trial.
    pub fn before_call(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.total_calls += 1;
                Ok(())
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.config.recovery_timeout() {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.total_calls += 1;
                    Ok(())
                } else {
                    inner.total_rejections += 1;
                    debug!(
                        "{}: circuit open, {:?} until trial call",
                        self.name,
                        self.config.recovery_timeout() - elapsed
                    );
                    Err(MigrateError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    /// Records a success.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                debug!("{}: success", self.name);
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                debug!(
                    "{}: half-open success {}/{}",
                    self.name, inner.success_count, self.config.success_threshold
                );
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                debug!("{}: success recorded while open", self.name);
            }
        }
    }

    /// Records a failure.
    pub fn record_failure(&self, error: &str) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.last_failure_time = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.recent_errors.push_back(RecentError {
            at: Utc::now(),
            message: error.to_string(),
        });
        while inner.recent_errors.len() > self.config.max_recent_errors {
            inner.recent_errors.pop_front();
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                debug!(
                    "{}: failure {}/{}: {}",
                    self.name, inner.failure_count, self.config.failure_threshold, error
                );
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Only transient and source errors count as failures; other errors
    /// pass through without affecting the breaker.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if counts_as_failure(&e) {
                    self.record_failure(&e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Force the breaker back to a fresh closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = Inner::new();
        info!("{}: circuit breaker reset", self.name);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            recent_errors: inner.recent_errors.iter().cloned().collect(),
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.failure_count = 0;
        inner.success_count = 0;

        match to {
            CircuitState::Open => warn!("{}: circuit {} -> {}", self.name, from, to),
            _ => info!("{}: circuit {} -> {}", self.name, from, to),
        }
    }
}

fn counts_as_failure(error: &MigrateError) -> bool {
    error.is_transient() || matches!(error, MigrateError::Source(_))
}
