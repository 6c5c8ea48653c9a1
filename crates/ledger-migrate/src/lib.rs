//! # ledger-migrate
//!
//! Bulk migration of accounting records from a rate-limited source API into
//! a target accounting system.
//!
//! This library provides the core functionality for:
//!
//! - **Adaptive date chunking** that keeps every fetch under the API record limit
//! - **Resilient fetching** behind a token-bucket rate limiter and circuit breaker
//! - **Duplicate detection** with exact, fuzzy, composite and temporal strategies
//! - **Pre-import validation** of required fields, references and balances
//! - **Checkpoints and rollback** of everything a failed run created
//! - **Dry runs** that simulate an import and report its financial impact
//! - **Audit trail** of every phase and record-level decision
//!
//! ## Example
//!
//! ```rust,no_run
//! use ledger_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> ledger_migrate::Result<()> {
//!     let config = Config::load("migration.yaml")?;
//!     let orchestrator = Orchestrator::from_config(config)?;
//!     let report = orchestrator.run().await?;
//!     println!("Imported {} records", report.import.records.succeeded);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod batch;
pub mod chunking;
pub mod config;
pub mod core;
pub mod dry_run;
pub mod duplicate;
pub mod error;
pub mod orchestrator;
pub mod resilience;
pub mod source;
pub mod state;
pub mod target;
pub mod transaction;
pub mod validation;

// Re-exports for convenient access
pub use audit::{AuditSummary, AuditTrail};
pub use batch::{BatchProcessor, BatchStats, ProgressEvent, ProgressSink};
pub use chunking::{DateRangeChunker, StrategyEstimate};
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use core::{EntityType, ExternalRecord, Filter, Severity, SourceApi, TargetSystem};
pub use dry_run::{DryRunReport, DryRunSimulator};
pub use duplicate::DuplicateDetector;
pub use error::{MigrateError, Result};
pub use orchestrator::{MigrationReport, Orchestrator, PrevalidationReport};
pub use resilience::ResilienceRegistry;
pub use source::{FileSource, ResilientSource};
pub use state::{MigrationRun, RunStatus};
pub use target::{InMemoryTarget, JsonFileTarget};
pub use transaction::{IntegrityReport, IntegrityStatus, RollbackReport, TransactionManager};
pub use validation::PreImportValidator;
