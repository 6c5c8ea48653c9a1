//! Configuration type definitions with auto-tuning based on system resources.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source accounting API.
    pub source: SourceConfig,

    /// Target system.
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Rate limiting, circuit breaking and retries for source calls.
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Duplicate detection policy.
    #[serde(default)]
    pub duplicates: DuplicateConfig,

    /// Ledger accounts used when building target documents.
    #[serde(default)]
    pub accounts: AccountMapping,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source API configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Endpoint label; resilience state is keyed by it.
    pub endpoint: String,

    /// JSON export consumed by the file-backed source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_file: Option<PathBuf>,

    /// Maximum records the API returns per call (default: 500).
    #[serde(default = "default_api_limit")]
    pub api_limit: usize,

    /// API credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("endpoint", &self.endpoint)
            .field("records_file", &self.records_file)
            .field("api_limit", &self.api_limit)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Target system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Scope (company) the run writes into. Only one run per scope at a time.
    pub scope: String,

    /// JSON store backing the file target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

/// Migration behavior configuration.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// First posting date to import (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,

    /// Last posting date to import (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,

    /// Records per batch. Auto-tuned from memory if not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Parallel workers per batch. Auto-tuned based on CPU cores if not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    pub dry_run: bool,

    /// Skip records with an exact duplicate in the target (default: true).
    pub skip_existing: bool,

    pub use_date_chunking: bool,

    /// Expected source volume; sampled from the API if not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_records_per_day: Option<f64>,

    /// Directory for audit, checkpoint, backup and report files.
    pub output_dir: PathBuf,

    pub audit_flush_interval: usize,
    pub progress_interval_secs: u64,

    /// Clear lookup caches every N batches.
    pub cache_clear_interval: usize,

    /// Pre-validation failure percentage that blocks the import.
    pub max_prevalidation_failure_pct: f64,

    /// Attempts per target create on transient errors.
    pub create_attempts: u32,

    /// Snapshot affected entity types before importing.
    pub backup: bool,

    /// Maximum records per entity type in the backup snapshot.
    pub backup_limit: usize,

    pub chunking: ChunkingConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            date_from: None,
            date_to: None,
            batch_size: None,
            workers: None,
            dry_run: false,
            skip_existing: true,
            use_date_chunking: true,
            estimated_records_per_day: None,
            output_dir: PathBuf::from("migration_output"),
            audit_flush_interval: 50,
            progress_interval_secs: 5,
            cache_clear_interval: 10,
            max_prevalidation_failure_pct: 10.0,
            create_attempts: 3,
            backup: true,
            backup_limit: 10_000,
            chunking: ChunkingConfig::default(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Workers are mostly waiting on the target; cores - 1, between 2 and 16
        if self.workers.is_none() {
            let workers = resources.cpu_cores.saturating_sub(1).clamp(2, 16);
            self.workers = Some(workers);
        }

        // Larger batches only pay off with enough memory to hold checkpoints
        if self.batch_size.is_none() {
            let batch = if resources.total_memory_gb >= 8.0 { 200 } else { 100 };
            self.batch_size = Some(batch);
        }

        info!(
            "Auto-tuned config: workers={}, batch_size={}",
            self.get_workers(),
            self.get_batch_size()
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(100)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

/// Adaptive date-range chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Fraction of the API limit a chunk aims for.
    pub safety_margin: f64,
    pub initial_days: i64,
    pub min_days: i64,
    pub max_days: i64,
    /// Shrink-and-retry attempts per date range before giving up.
    pub max_shrink_retries: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            safety_margin: 0.9,
            initial_days: 7,
            min_days: 1,
            max_days: 30,
            max_shrink_retries: 6,
        }
    }
}

/// Resilience settings for calls to the source API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

/// Token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity.
    pub max_tokens: u32,
    /// Tokens added per refill period.
    pub refill_rate: f64,
    pub refill_period_ms: u64,
    /// Default wait for `acquire` with waiting enabled.
    pub acquire_timeout_secs: u64,
    /// Consecutive successes before the refill rate is raised.
    pub adaptive_success_threshold: u32,
    pub min_refill_rate: f64,
    pub max_refill_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 20,
            refill_rate: 10.0,
            refill_period_ms: 1000,
            acquire_timeout_secs: 30,
            adaptive_success_threshold: 100,
            min_refill_rate: 1.0,
            max_refill_rate: 50.0,
        }
    }
}

impl RateLimitConfig {
    pub fn refill_period(&self) -> Duration {
        Duration::from_millis(self.refill_period_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Half-open successes that close the circuit.
    pub success_threshold: u32,
    pub recovery_timeout_secs: u64,
    /// Recent errors kept for snapshots.
    pub max_recent_errors: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_secs: 60,
            max_recent_errors: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

/// Duplicate detection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Stable identifiers: external id, reference number, composite unique key.
    Exact,
    /// String similarity within a date and amount window.
    Fuzzy,
    /// Party + date + amount.
    CompositeKey,
    /// Same party/amount/date created within a short window.
    Temporal,
}

impl MatchStrategy {
    pub const ALL: [MatchStrategy; 4] = [
        MatchStrategy::Exact,
        MatchStrategy::Fuzzy,
        MatchStrategy::CompositeKey,
        MatchStrategy::Temporal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::Fuzzy => "fuzzy",
            MatchStrategy::CompositeKey => "composite_key",
            MatchStrategy::Temporal => "temporal",
        }
    }
}

/// How confidences from several matching strategies are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinePolicy {
    /// Highest single confidence.
    #[default]
    Max,
    /// 1 - Π(1 - cᵢ): independent evidence reinforces, capped at 100.
    ProbabilisticOr,
}

/// Duplicate detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateConfig {
    /// Strategies run when the caller does not pick any.
    pub strategies: Vec<MatchStrategy>,
    /// Minimum similarity percentage for a fuzzy match.
    pub fuzzy_threshold: f64,
    pub fuzzy_fields: Vec<String>,
    /// Days either side of the posting date considered by fuzzy matching.
    pub date_window_days: i64,
    pub amount_tolerance_pct: f64,
    /// Creation-time window for temporal matching.
    pub temporal_window_secs: i64,
    pub combine: CombinePolicy,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            strategies: MatchStrategy::ALL.to_vec(),
            fuzzy_threshold: 80.0,
            fuzzy_fields: vec!["description".to_string(), "reference_no".to_string()],
            date_window_days: 7,
            amount_tolerance_pct: 5.0,
            temporal_window_secs: 300,
            combine: CombinePolicy::default(),
        }
    }
}

/// Ledger accounts used to build target documents.
///
/// There is no fallback: a missing mapping fails pre-validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountMapping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receivable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bank: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub income: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expense: Option<String>,
}

impl AccountMapping {
    /// All configured accounts with their role names.
    pub fn entries(&self) -> Vec<(&'static str, Option<&str>)> {
        vec![
            ("receivable", self.receivable.as_deref()),
            ("payable", self.payable.as_deref()),
            ("bank", self.bank.as_deref()),
            ("income", self.income.as_deref()),
            ("expense", self.expense.as_deref()),
        ]
    }
}

fn default_api_limit() -> usize {
    500
}
