//! Resilience primitives for calls to the source API.
//!
//! Limiter and breaker instances are injected explicitly. The
//! [`ResilienceRegistry`] hands out one pair per endpoint and is the only
//! place that owns them; [`ResilienceRegistry::reset`] discards all state.

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, RecentError};
pub use rate_limiter::{parse_retry_after, AdaptiveRateLimiter, RateLimiter, RateLimiterSnapshot};
pub use retry::retry_with_backoff;

use crate::config::ResilienceConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Rate limiter and circuit breaker for one endpoint.
#[derive(Debug)]
pub struct EndpointGuard {
    pub endpoint: String,
    pub limiter: AdaptiveRateLimiter,
    pub breaker: CircuitBreaker,
}

/// Combined observability view of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub limiter: RateLimiterSnapshot,
    pub breaker: CircuitSnapshot,
}

impl EndpointGuard {
    pub fn new(endpoint: impl Into<String>, config: &ResilienceConfig) -> Self {
        let endpoint = endpoint.into();
        Self {
            limiter: AdaptiveRateLimiter::new(endpoint.clone(), &config.rate_limit),
            breaker: CircuitBreaker::new(endpoint.clone(), config.circuit_breaker.clone()),
            endpoint,
        }
    }

    pub async fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            limiter: self.limiter.snapshot().await,
            breaker: self.breaker.snapshot(),
        }
    }
}

/// Per-endpoint resilience state.
#[derive(Debug)]
pub struct ResilienceRegistry {
    config: ResilienceConfig,
    guards: Mutex<HashMap<String, Arc<EndpointGuard>>>,
}

impl ResilienceRegistry {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Guard for `endpoint`, created on first use.
    pub fn guard(&self, endpoint: &str) -> Arc<EndpointGuard> {
        let mut guards = self.guards.lock().unwrap_or_else(|p| p.into_inner());
        guards
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(EndpointGuard::new(endpoint, &self.config)))
            .clone()
    }

    /// Drop the state of every endpoint.
    pub fn reset(&self) {
        let mut guards = self.guards.lock().unwrap_or_else(|p| p.into_inner());
        let count = guards.len();
        guards.clear();
        info!("Reset resilience state for {} endpoint(s)", count);
    }

    pub async fn snapshots(&self) -> Vec<EndpointSnapshot> {
        let guards: Vec<Arc<EndpointGuard>> = {
            let guards = self.guards.lock().unwrap_or_else(|p| p.into_inner());
            guards.values().cloned().collect()
        };
        let mut snapshots = Vec::with_capacity(guards.len());
        for guard in guards {
            snapshots.push(guard.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.breaker.name.cmp(&b.breaker.name));
        snapshots
    }
}
