//! Migration orchestrator - drives a run through its phases.
//!
//! Phases run strictly in order and report overall progress when they
//! complete: initialization (5%), prevalidation (10%), backup and planning
//! (20%), import (90%), verification (95%) and summary (100%). Every phase is
//! an audited operation. A failing phase is recorded as a critical audit
//! event, open checkpoints are rolled back, and the error is returned.

pub mod import;

pub use import::{
    ChunkImporter, DocumentBuilder, ImportHandler, ImportMode, PreparedRecord, DUPLICATE,
    UNKNOWN_RECORD_TYPE,
};

use crate::audit::{AuditHeader, AuditSummary, AuditTrail, JsonlFileStore};
use crate::batch::{BatchProcessor, BatchStats, ProgressSink};
use crate::chunking::{Chunk, ChunkResult, ChunkWorker, ChunkingReport, DateRangeChunker, StrategyEstimate};
use crate::config::Config;
use crate::core::{
    EntityType, ExternalRecord, Filter, Mutation, Recommendation, Severity, SourceApi, TargetSystem,
};
use crate::dry_run::{DryRunReport, DryRunSimulator};
use crate::duplicate::DuplicateDetector;
use crate::error::{MigrateError, Result};
use crate::resilience::ResilienceRegistry;
use crate::source::{FileSource, ResilientSource};
use crate::state::{write_json_atomic, MigrationRun, RunStatus, ScopeLock};
use crate::target::JsonFileTarget;
use crate::transaction::{
    load_checkpoint, undo_checkpoint, verify_data_integrity, BackupSummary, IntegrityReport,
    IntegrityStatus, RollbackReport, TransactionManager,
};
use crate::validation::{PreImportValidator, ValidationSummary};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const AUDIT_FILE: &str = "audit_trail.jsonl";
pub const STATE_FILE: &str = "run_state.json";
pub const REPORT_FILE: &str = "migration_report.json";
pub const DRY_RUN_REPORT_FILE: &str = "dry_run_report.json";

/// Days sampled by prevalidation.
const SAMPLE_DAYS: i64 = 7;

/// Outcome of validating a sample before anything is written.
#[derive(Debug, Clone, Serialize)]
pub struct PrevalidationReport {
    pub sample_from: NaiveDate,
    pub sample_to: NaiveDate,
    pub sampled_records: usize,
    pub unknown_records: usize,
    /// Account roles the sample needs that are not mapped.
    pub missing_accounts: Vec<String>,
    pub summary: ValidationSummary,
    pub recommendations: Vec<Recommendation>,
    pub passed: bool,
}

/// One fetched window of the import.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkOutcome {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub records: Option<usize>,
    pub shrink_retries: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub records: BatchStats,
    pub chunks: Vec<ChunkOutcome>,
    pub failed_chunks: usize,
    pub api_calls: usize,
    pub fetched_records: usize,
}

impl ImportSummary {
    fn from_chunking(report: ChunkingReport<BatchStats>) -> Self {
        let mut summary = ImportSummary {
            api_calls: report.api_calls,
            fetched_records: report.total_records,
            ..Default::default()
        };
        for result in report.results {
            if !result.is_success() {
                summary.failed_chunks += 1;
            }
            summary.chunks.push(ChunkOutcome {
                from: result.chunk.from,
                to: result.chunk.to,
                records: result.chunk.actual_records,
                shrink_retries: result.shrink_retries,
                error: result.error,
            });
            if let Some(stats) = result.output {
                summary.records.merge(stats);
            }
        }
        summary
    }
}

/// Composite result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: String,
    pub scope: String,
    pub dry_run: bool,
    pub status: RunStatus,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub prevalidation: PrevalidationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<StrategyEstimate>,
    pub planned_chunks: Vec<Chunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSummary>,
    pub import: ImportSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run_report: Option<DryRunReport>,
    pub audit: AuditSummary,
    pub output_dir: PathBuf,
    /// No chunk failed and integrity verification did not fail.
    pub success: bool,
}

/// Fetches sample windows without importing them.
struct SampleFetcher {
    source: Arc<ResilientSource>,
}

#[async_trait]
impl ChunkWorker for SampleFetcher {
    type Output = ();

    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<ExternalRecord>> {
        self.source.fetch(from, to).await
    }

    async fn process(&self, _chunk: &Chunk, _records: Vec<ExternalRecord>) -> Result<()> {
        Ok(())
    }
}

/// Per-run state threaded through the phases.
struct RunContext {
    run: MigrationRun,
    run_dir: PathBuf,
    audit: Arc<AuditTrail>,
    transactions: Arc<TransactionManager>,
    progress: ProgressSink,
}

impl RunContext {
    fn state_path(&self) -> PathBuf {
        self.run_dir.join(STATE_FILE)
    }

    fn begin(&mut self, phase: &str, percent: u8) -> Result<()> {
        info!("Phase {}: {}", phase, self.run.run_id);
        self.run.begin_phase(phase, percent);
        let path = self.state_path();
        self.run.save(path)
    }

    fn finish(&mut self) -> Result<()> {
        self.run.end_phase(None);
        if let Some(phase) = self.run.current_phase() {
            self.progress.phase(&phase.phase, phase.percent);
        }
        let path = self.state_path();
        self.run.save(path)
    }
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceApi>,
    target: Arc<dyn TargetSystem>,
    registry: Arc<ResilienceRegistry>,
    progress: ProgressSink,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, source: Arc<dyn SourceApi>, target: Arc<dyn TargetSystem>) -> Self {
        let registry = Arc::new(ResilienceRegistry::new(config.resilience.clone()));
        Self {
            config,
            source,
            target,
            registry,
            progress: ProgressSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    /// Orchestrator over the file-backed source and target named in the
    /// configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let records = config.source.records_file.clone().ok_or_else(|| {
            MigrateError::Config("source.records_file is required for the file source".into())
        })?;
        let store = config.target.store_path.clone().ok_or_else(|| {
            MigrateError::Config("target.store_path is required for the file target".into())
        })?;
        let source = FileSource::load(&records, config.source.endpoint.clone(), config.source.api_limit)?;
        let target = JsonFileTarget::open(&store)?;
        Ok(Self::new(config, Arc::new(source), Arc::new(target)))
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        Ok(())
    }

    fn resilient_source(&self, audit: Option<Arc<AuditTrail>>) -> Arc<ResilientSource> {
        let source = ResilientSource::new(self.source.clone(), &self.registry);
        Arc::new(match audit {
            Some(audit) => source.with_audit(audit),
            None => source,
        })
    }

    fn chunker(&self) -> DateRangeChunker {
        DateRangeChunker::new(self.config.source.api_limit, self.config.migration.chunking.clone())
    }

    fn scope_filter(from: NaiveDate, to: NaiveDate) -> Filter {
        Filter::new().between("posting_date", from.to_string(), to.to_string())
    }

    /// A draft run for the configured scope and date range.
    pub fn prepare_run(&self) -> Result<MigrationRun> {
        Ok(MigrationRun::new(
            self.config.target.scope.clone(),
            self.config.hash(),
            self.config.date_range()?,
            self.config.migration.dry_run,
            self.config.migration.get_batch_size(),
        ))
    }

    /// Prepare and execute a run.
    pub async fn run(&self) -> Result<MigrationReport> {
        let run = self.prepare_run()?;
        self.execute(run).await
    }

    /// Execute a draft run.
    pub async fn execute(&self, run: MigrationRun) -> Result<MigrationReport> {
        run.validate_config(&self.config.hash())?;
        let migration = &self.config.migration;
        let _lock = ScopeLock::acquire(
            migration.output_dir.join("locks"),
            &self.config.target.scope_slug(),
            &run.run_id,
        )?;

        let run_dir = migration.run_dir(&run.run_id);
        std::fs::create_dir_all(&run_dir)?;
        let header = AuditHeader {
            migration_id: run.run_id.clone(),
            scope: run.scope.clone(),
            started_at: Utc::now(),
            date_from: Some(run.date_from),
            date_to: Some(run.date_to),
            dry_run: run.dry_run,
            settings: serde_json::to_value(&self.config)?,
        };
        let store = Arc::new(JsonlFileStore::open(run_dir.join(AUDIT_FILE))?);
        let audit = Arc::new(AuditTrail::new(header, store, migration.audit_flush_interval)?);
        let transactions = Arc::new(
            TransactionManager::new(run.run_id.clone(), self.target.clone())
                .with_audit(audit.clone())
                .with_output_dir(&run_dir),
        );

        let mut ctx = RunContext {
            run,
            run_dir,
            audit,
            transactions,
            progress: self.progress.clone(),
        };
        ctx.run.start()?;
        info!(
            "Starting migration run {} for {} ({} to {}{})",
            ctx.run.run_id,
            ctx.run.scope,
            ctx.run.date_from,
            ctx.run.date_to,
            if ctx.run.dry_run { ", dry run" } else { "" }
        );

        match self.run_phases(&mut ctx).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.abort(&mut ctx, &e).await;
                Err(e)
            }
        }
    }

    async fn run_phases(&self, ctx: &mut RunContext) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let audit = ctx.audit.clone();
        let transactions = ctx.transactions.clone();
        let dry_run = ctx.run.dry_run;
        let (from, to) = (ctx.run.date_from, ctx.run.date_to);
        let scope = Self::scope_filter(from, to);
        let migration = &self.config.migration;

        ctx.begin("initialization", 5)?;
        let source = self.resilient_source(Some(audit.clone()));
        let simulator = Arc::new(DryRunSimulator::new(self.target.clone()));
        let mode = if dry_run {
            ImportMode::DryRun(simulator.clone())
        } else {
            ImportMode::Live {
                transactions: transactions.clone(),
                validator: PreImportValidator::for_target(self.target.clone()),
                attempts: migration.create_attempts,
                retry: self.config.resilience.retry.clone(),
            }
        };
        let handler = Arc::new(ImportHandler::new(
            self.target.clone(),
            DuplicateDetector::new(self.target.clone(), self.config.duplicates.clone()),
            audit.clone(),
            mode,
            migration.skip_existing,
        ));
        let processor = BatchProcessor::new(migration.get_batch_size(), migration.get_workers())
            .with_progress(self.progress.clone(), migration.progress_interval())
            .with_cache_clear_interval(migration.cache_clear_interval)
            .with_cancellation(self.cancel.clone());
        let builder = DocumentBuilder::new(self.config.accounts.clone());
        let importer = ChunkImporter::new(source.clone(), builder.clone(), handler, processor, audit.clone())
            .with_cancellation(self.cancel.clone());
        audit.log_compliance_note(
            "data_handling",
            "source records are previewed in the audit trail, never stored in full",
        );
        ctx.finish()?;

        self.check_cancelled()?;
        ctx.begin("prevalidation", 10)?;
        let prevalidation = audit
            .audited(
                "prevalidation",
                json!({ "from": from, "to": to }),
                self.prevalidate_with(&source, &builder, from, to),
            )
            .await?;
        if !prevalidation.passed {
            let message = prevalidation_failure(&prevalidation);
            if dry_run {
                warn!("Prevalidation failed, continuing dry run: {}", message);
                audit.log_event("prevalidation_failed", json!({ "message": message }), Severity::Warning);
            } else {
                return Err(MigrateError::validation("prevalidation", message));
            }
        }
        ctx.finish()?;

        self.check_cancelled()?;
        ctx.begin("backup", 20)?;
        let backup = if !dry_run && migration.backup {
            Some(
                audit
                    .audited(
                        "backup",
                        json!({ "limit": migration.backup_limit }),
                        transactions.create_pre_migration_backup(&EntityType::TRANSACTIONS, &scope, migration.backup_limit),
                    )
                    .await?,
            )
        } else {
            None
        };
        let chunker = self.chunker();
        let estimate = match (migration.use_date_chunking, migration.estimated_records_per_day) {
            (true, None) => {
                let sampler = SampleFetcher { source: source.clone() };
                Some(
                    audit
                        .audited("estimate", json!({}), chunker.estimate_optimal_strategy(from, to, &sampler))
                        .await?,
                )
            }
            _ => None,
        };
        let rate = migration
            .estimated_records_per_day
            .or_else(|| estimate.as_ref().map(|e| e.records_per_day));
        let planned_chunks = match (migration.use_date_chunking, rate) {
            (true, Some(rate)) => chunker.calculate_optimal_chunks(from, to, rate),
            _ => Vec::new(),
        };
        ctx.finish()?;

        self.check_cancelled()?;
        ctx.begin("import", 90)?;
        let details = json!({ "dry_run": dry_run, "chunked": migration.use_date_chunking });
        let import = if dry_run {
            audit
                .audited("import", details, self.import_range(&chunker, &importer, from, to))
                .await?
        } else {
            audit
                .audited(
                    "import",
                    details,
                    transactions.atomic_operation("import", |_checkpoint| {
                        self.import_range(&chunker, &importer, from, to)
                    }),
                )
                .await?
        };
        ctx.finish()?;

        self.check_cancelled()?;
        ctx.begin("verification", 95)?;
        let integrity = if dry_run {
            None
        } else {
            let report = audit
                .audited(
                    "integrity_verification",
                    json!({}),
                    verify_data_integrity(self.target.as_ref(), &scope),
                )
                .await?;
            if report.status == IntegrityStatus::Failed {
                audit.log_event(
                    "integrity_violation",
                    json!({ "issues": report.total_issues, "checks": report.checks }),
                    Severity::Error,
                );
            }
            Some(report)
        };
        ctx.finish()?;

        ctx.begin("summary", 100)?;
        audit.flush()?;
        let dry_run_report = dry_run.then(|| simulator.generate_dry_run_report());
        if let Some(report) = &dry_run_report {
            write_json_atomic(ctx.run_dir.join(DRY_RUN_REPORT_FILE), report)?;
        }
        ctx.finish()?;
        ctx.run.mark_completed();
        let state_path = ctx.state_path();
        ctx.run.save(state_path)?;

        let completed_at = Utc::now();
        let success = import.failed_chunks == 0
            && integrity
                .as_ref()
                .map_or(true, |r| r.status != IntegrityStatus::Failed);
        let report = MigrationReport {
            run_id: ctx.run.run_id.clone(),
            scope: ctx.run.scope.clone(),
            dry_run,
            status: ctx.run.status,
            date_from: from,
            date_to: to,
            started_at,
            completed_at,
            duration_secs: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            prevalidation,
            estimate,
            planned_chunks,
            backup,
            import,
            integrity,
            dry_run_report,
            audit: audit.generate_summary_report(),
            output_dir: ctx.run_dir.clone(),
            success,
        };
        write_json_atomic(ctx.run_dir.join(REPORT_FILE), &report)?;
        info!(
            "Migration run {} completed: {} imported, {} skipped, {} failed",
            report.run_id,
            report.import.records.succeeded,
            report.import.records.skipped,
            report.import.records.failed
        );
        Ok(report)
    }

    /// Record the failure, roll back open checkpoints and persist the
    /// failed state. Errors here are logged; the original error wins.
    async fn abort(&self, ctx: &mut RunContext, e: &MigrateError) {
        let phase = ctx
            .run
            .current_phase()
            .map(|p| p.phase.clone())
            .unwrap_or_default();
        error!("Migration run {} failed in {}: {}", ctx.run.run_id, phase, e);
        ctx.audit.log_event(
            "migration_failed",
            json!({ "phase": phase, "error": e.to_string(), "error_kind": e.kind() }),
            Severity::Critical,
        );

        if !ctx.run.dry_run {
            match ctx.transactions.rollback_open(&e.to_string()).await {
                Ok(Some(report)) => info!(
                    "Rolled back {} tracked mutation(s) after failure",
                    report.steps.len()
                ),
                Ok(None) => {}
                Err(rollback_error) => error!("Rollback after failure failed: {}", rollback_error),
            }
        }

        ctx.run.mark_failed(&e.to_string());
        let state_path = ctx.state_path();
        if let Err(save_error) = ctx.run.save(state_path) {
            warn!("Failed to save run state: {}", save_error);
        }
        if let Err(flush_error) = ctx.audit.flush() {
            warn!("Failed to flush audit trail: {}", flush_error);
        }
    }

    async fn import_range(
        &self,
        chunker: &DateRangeChunker,
        importer: &ChunkImporter,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<ImportSummary> {
        if self.config.migration.use_date_chunking {
            let report = chunker.adaptive_chunk_processing(from, to, importer).await?;
            return Ok(ImportSummary::from_chunking(report));
        }

        // Single request; a full page means the source truncated the range
        let records = importer.fetch(from, to).await?;
        let returned = records.len();
        let mut chunk = Chunk::new(from, to, returned);
        chunk.actual_records = Some(returned);
        let error = (returned >= chunker.api_limit()).then(|| {
            let e = MigrateError::ApiLimitExceeded {
                returned,
                limit: chunker.api_limit(),
            };
            warn!("Single request for {}..{}: {}", from, to, e);
            e.to_string()
        });
        let stats = importer.process(&chunk, records).await?;
        Ok(ImportSummary::from_chunking(ChunkingReport {
            results: vec![ChunkResult {
                chunk,
                shrink_retries: 0,
                output: Some(stats),
                error,
            }],
            api_calls: 1,
            total_records: returned,
        }))
    }

    async fn prevalidate_with(
        &self,
        source: &ResilientSource,
        builder: &DocumentBuilder,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<PrevalidationReport> {
        let sample_to = std::cmp::min(from + Duration::days(SAMPLE_DAYS - 1), to);
        let mutations: Vec<Mutation> = source
            .fetch(from, sample_to)
            .await?
            .into_iter()
            .map(Mutation::classify)
            .collect();
        let missing_accounts: Vec<String> = builder
            .missing_accounts(&mutations)
            .into_iter()
            .map(str::to_string)
            .collect();

        let sampled_records = mutations.len();
        let mut unknown_records = 0;
        let mut candidates = Vec::new();
        for mutation in mutations {
            let prepared = builder.prepare(mutation);
            match prepared.entity {
                None => unknown_records += 1,
                Some(entity) if prepared.problem.is_none() => candidates.push((entity, prepared.doc)),
                Some(_) => {}
            }
        }

        let validator = PreImportValidator::for_target(self.target.clone());
        let batch = validator.validate_batch(&candidates).await?;
        let max_pct = self.config.migration.max_prevalidation_failure_pct;
        let passed = missing_accounts.is_empty() && batch.summary.can_proceed(max_pct);
        info!(
            "Prevalidation of {} sampled records: {} passed, {} failed, {} unknown",
            sampled_records, batch.summary.passed, batch.summary.failed, unknown_records
        );
        Ok(PrevalidationReport {
            sample_from: from,
            sample_to,
            sampled_records,
            unknown_records,
            missing_accounts,
            summary: batch.summary,
            recommendations: batch.recommendations,
            passed,
        })
    }

    /// Validate a sample of the configured range without writing anything.
    pub async fn prevalidate(&self) -> Result<PrevalidationReport> {
        let (from, to) = self.config.date_range()?;
        let source = self.resilient_source(None);
        let builder = DocumentBuilder::new(self.config.accounts.clone());
        self.prevalidate_with(&source, &builder, from, to).await
    }

    /// Sample the source and recommend a fetch strategy.
    pub async fn estimate(&self) -> Result<StrategyEstimate> {
        let (from, to) = self.config.date_range()?;
        let sampler = SampleFetcher {
            source: self.resilient_source(None),
        };
        self.chunker().estimate_optimal_strategy(from, to, &sampler).await
    }

    /// Run the integrity checks over the configured range.
    pub async fn verify(&self) -> Result<IntegrityReport> {
        let (from, to) = self.config.date_range()?;
        verify_data_integrity(self.target.as_ref(), &Self::scope_filter(from, to)).await
    }

    /// Replay the undo steps of a persisted checkpoint.
    pub async fn rollback_checkpoint(&self, path: &Path, reason: &str) -> Result<RollbackReport> {
        let checkpoint = load_checkpoint(path)?;
        info!(
            "Rolling back checkpoint {} ({} tracked mutations)",
            checkpoint.id,
            checkpoint.tracked()
        );
        Ok(undo_checkpoint(self.target.as_ref(), &checkpoint, reason).await)
    }
}

fn prevalidation_failure(report: &PrevalidationReport) -> String {
    if !report.missing_accounts.is_empty() {
        return format!("no account mapped for: {}", report.missing_accounts.join(", "));
    }
    format!(
        "{:.1}% of {} sampled records failed validation",
        report.summary.failure_rate(),
        report.summary.total
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{read_lines, AuditLine};
    use crate::core::Document;
    use crate::target::InMemoryTarget;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(dir: &Path, extra: &str) -> Config {
        let yaml = format!(
            r#"
source:
  endpoint: file://records
  api_limit: 50
target:
  scope: Test BV
migration:
  date_from: 2024-01-01
  date_to: 2024-01-31
  batch_size: 2
  workers: 2
  output_dir: {}
{}
accounts:
  receivable: 1300 Debtors
  payable: 1600 Creditors
  bank: 1100 Bank
  income: 8000 Revenue
  expense: 4000 Costs
"#,
            dir.display(),
            extra
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn record(record_type: &str, id: &str, day: u32, amount: &str) -> ExternalRecord {
        ExternalRecord {
            record_type: record_type.into(),
            external_id: id.into(),
            posting_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            amount: Decimal::from_str(amount).unwrap(),
            party_reference: Some("CUST-1".into()),
            reference_no: None,
            description: None,
            lines: vec![],
            invoice_reference: None,
            created_at: None,
        }
    }

    fn records() -> Vec<ExternalRecord> {
        let mut payment = record("payment_received", "P-1", 20, "100");
        payment.invoice_reference = Some("F-1".into());
        vec![
            record("sales_invoice", "F-1", 2, "100"),
            record("sales_invoice", "F-2", 3, "250"),
            record("sales_invoice", "F-3", 9, "400"),
            record("sales_invoice", "F-4", 16, "800"),
            record("btw_aangifte", "X-1", 17, "1"),
            payment,
        ]
    }

    fn seeded() -> InMemoryTarget {
        let target = InMemoryTarget::new();
        target.insert(EntityType::Customer, "CUST-1", doc(json!({"customer_name": "Jansen"})));
        for account in ["1300 Debtors", "1100 Bank", "8000 Revenue"] {
            target.insert(EntityType::Account, account, doc(json!({ "account_name": account })));
        }
        target
    }

    fn orchestrator(config: Config, target: Arc<dyn TargetSystem>) -> Orchestrator {
        let source = Arc::new(FileSource::from_records("file://records", records(), 50));
        Orchestrator::new(config, source, target)
    }

    /// Cancels the run once `after` records have been created.
    struct CancellingTarget {
        inner: InMemoryTarget,
        cancel: CancellationToken,
        after: usize,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl TargetSystem for CancellingTarget {
        fn name(&self) -> &str {
            "cancelling"
        }
        async fn create(&self, entity: EntityType, data: Document) -> Result<String> {
            let name = self.inner.create(entity, data).await?;
            if self.creates.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.cancel.cancel();
            }
            Ok(name)
        }
        async fn update(&self, entity: EntityType, id: &str, changes: Document) -> Result<()> {
            self.inner.update(entity, id, changes).await
        }
        async fn delete(&self, entity: EntityType, id: &str) -> Result<()> {
            self.inner.delete(entity, id).await
        }
        async fn submit(&self, entity: EntityType, id: &str) -> Result<()> {
            self.inner.submit(entity, id).await
        }
        async fn cancel(&self, entity: EntityType, id: &str) -> Result<()> {
            self.inner.cancel(entity, id).await
        }
        async fn get(&self, entity: EntityType, id: &str) -> Result<Option<Document>> {
            self.inner.get(entity, id).await
        }
        async fn query(&self, entity: EntityType, filter: &Filter) -> Result<Vec<Document>> {
            self.inner.query(entity, filter).await
        }
    }

    #[tokio::test]
    async fn test_live_run_imports_and_verifies() {
        let dir = TempDir::new().unwrap();
        let target = Arc::new(seeded());
        let (tx, mut rx) = tokio::sync::mpsc::channel(256);
        let report = orchestrator(config(dir.path(), ""), target.clone())
            .with_progress(ProgressSink::new(tx))
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.success);
        assert!(report.prevalidation.passed);
        assert_eq!(report.import.records.succeeded, 5);
        assert_eq!(report.import.records.skip_reasons.get(UNKNOWN_RECORD_TYPE), Some(&1));
        assert_eq!(target.count(EntityType::SalesInvoice), 4);
        assert_eq!(target.count(EntityType::PaymentEntry), 1);
        assert_eq!(report.integrity.as_ref().unwrap().status, IntegrityStatus::Passed);
        assert!(report.backup.is_some());

        let payment = &target.query(EntityType::PaymentEntry, &Filter::new()).await.unwrap()[0];
        assert!(payment["references"][0]["reference_name"].is_string());

        let state = MigrationRun::load(report.output_dir.join(STATE_FILE)).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        let phases: Vec<&str> = state.phases.iter().map(|p| p.phase.as_str()).collect();
        assert_eq!(
            phases,
            vec!["initialization", "prevalidation", "backup", "import", "verification", "summary"]
        );
        assert!(report.output_dir.join(REPORT_FILE).exists());
        assert!(report.output_dir.join("checkpoints").is_dir());

        let mut percents = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::batch::ProgressEvent::Phase { percent, .. } = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents, vec![5, 10, 20, 90, 95, 100]);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_target_untouched() {
        let dir = TempDir::new().unwrap();
        let target = Arc::new(seeded());
        let report = orchestrator(config(dir.path(), "  dry_run: true"), target.clone())
            .run()
            .await
            .unwrap();

        assert!(report.dry_run);
        assert!(report.integrity.is_none());
        assert!(report.backup.is_none());
        let simulation = report.dry_run_report.as_ref().unwrap();
        // The payment cannot link to a simulated invoice, but still validates
        assert_eq!(simulation.summary.would_succeed, 5);
        assert_eq!(target.count(EntityType::SalesInvoice), 0);
        assert_eq!(target.count(EntityType::PaymentEntry), 0);
        assert!(report.output_dir.join(DRY_RUN_REPORT_FILE).exists());
    }

    #[tokio::test]
    async fn test_failure_rolls_back_and_records_critical_event() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let target = Arc::new(CancellingTarget {
            inner: seeded(),
            cancel: cancel.clone(),
            after: 2,
            creates: AtomicUsize::new(0),
        });
        let orchestrator = orchestrator(config(dir.path(), ""), target.clone()).with_cancellation(cancel);
        let run = orchestrator.prepare_run().unwrap();
        let run_dir = orchestrator.config().migration.run_dir(&run.run_id);

        let err = orchestrator.execute(run).await.unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
        assert_eq!(target.inner.count(EntityType::SalesInvoice), 0);

        let state = MigrationRun::load(run_dir.join(STATE_FILE)).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.current_phase().unwrap().phase, "import");

        let entries: Vec<_> = read_lines(run_dir.join(AUDIT_FILE))
            .unwrap()
            .into_iter()
            .filter_map(|line| match line {
                AuditLine::Entry(entry) => Some(entry),
                _ => None,
            })
            .collect();
        assert!(entries.iter().any(|e| e.event_type == "rollback_performed"));
        let failed: Vec<_> = entries
            .iter()
            .filter(|e| e.event_type == "migration_failed")
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_missing_account_mapping_blocks_live_run() {
        let dir = TempDir::new().unwrap();
        let target = Arc::new(seeded());
        let mut config = config(dir.path(), "");
        config.accounts.income = None;
        let err = orchestrator(config, target.clone()).run().await.unwrap_err();
        match err {
            MigrateError::Validation { message, .. } => assert!(message.contains("income")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(target.count(EntityType::SalesInvoice), 0);
    }

    #[tokio::test]
    async fn test_one_run_per_scope() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), "");
        let _held = ScopeLock::acquire(dir.path().join("locks"), &config.target.scope_slug(), "other").unwrap();
        let err = orchestrator(config, Arc::new(seeded())).run().await.unwrap_err();
        assert!(matches!(err, MigrateError::ScopeLocked { .. }));
    }

    #[tokio::test]
    async fn test_estimate_and_verify() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(config(dir.path(), ""), Arc::new(seeded()));
        let estimate = orchestrator.estimate().await.unwrap();
        assert_eq!(estimate.sample_records, 2);
        let integrity = orchestrator.verify().await.unwrap();
        assert_eq!(integrity.status, IntegrityStatus::Passed);
    }
}
