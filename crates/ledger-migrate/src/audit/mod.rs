//! Structured, append-only audit trail of a migration run.
//!
//! Every phase and record-level decision is recorded as an [`AuditEntry`].
//! Entries are buffered and flushed to an [`AuditStore`] every
//! `flush_interval` entries; a rolling [`AuditStatistics`] line follows each
//! flush. Operations nest: an operation started while another is active
//! links to it as its parent.

mod report;
mod store;

pub use report::{ApiTotals, AuditSummary, ErrorSummary, OperationSummary, RecordTotals};
pub use store::{read_lines, AuditLine, AuditStore, JsonlFileStore, MemoryAuditStore};

use crate::core::{Document, EntityType, Severity};
use crate::error::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Fields copied into record previews.
const PREVIEW_FIELDS: [&str; 12] = [
    "name",
    "external_id",
    "reference_no",
    "posting_date",
    "customer",
    "supplier",
    "party",
    "grand_total",
    "paid_amount",
    "total_debit",
    "description",
    "account_name",
];

/// Maximum characters of a previewed field.
const PREVIEW_MAX_CHARS: usize = 100;

/// Key fragments whose values are never written to the trail.
const SENSITIVE_KEYS: [&str; 6] = [
    "password",
    "security_code",
    "api_key",
    "secret",
    "token",
    "authorization",
];

const REDACTED: &str = "***REDACTED***";

/// Error messages kept per operation type in the summary.
const MAX_ERROR_SAMPLES: usize = 10;

/// First line of every trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditHeader {
    pub migration_id: String,
    pub scope: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
    pub dry_run: bool,
    /// Run settings (secrets redacted).
    #[serde(default)]
    pub settings: Value,
}

/// A single audit event. Never mutated after flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub data: Value,
    /// Active operation ids, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operation_context: Vec<String>,
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Failed,
    Skipped,
}

/// Aggregates for one operation type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    pub success: u64,
    pub failed: u64,
    pub total_duration_ms: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Running record-level counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordCounters {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub validation_errors: u64,
    pub duplicates: u64,
    pub batches: u64,
    pub rollbacks: u64,
    pub api_calls: u64,
    pub api_errors: u64,
    pub api_total_duration_ms: f64,
    pub transformations: u64,
    pub compliance_notes: u64,
    #[serde(default)]
    pub skip_reasons: BTreeMap<String, u64>,
}

/// Rolling statistics appended after every flush.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub total_entries: u64,
    pub records: RecordCounters,
    pub operations: BTreeMap<String, OperationStats>,
    pub events_by_severity: BTreeMap<Severity, u64>,
}

#[derive(Debug)]
struct ActiveOperation {
    op_type: String,
    parent: Option<String>,
    started: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    buffer: Vec<AuditLine>,
    next_sequence: u64,
    next_operation: u64,
    stack: Vec<String>,
    active: BTreeMap<String, ActiveOperation>,
    stats: AuditStatistics,
}

/// Audit trail of one migration run.
pub struct AuditTrail {
    migration_id: String,
    started: Instant,
    flush_interval: usize,
    store: Arc<dyn AuditStore>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("migration_id", &self.migration_id)
            .field("store", &self.store.location())
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

impl AuditTrail {
    /// Start a trail, writing its header immediately.
    pub fn new(header: AuditHeader, store: Arc<dyn AuditStore>, flush_interval: usize) -> Result<Self> {
        let mut header = header;
        redact(&mut header.settings);
        store.append(&[AuditLine::Header(header.clone())])?;
        info!(
            "Audit trail for {} started ({})",
            header.migration_id,
            store.location()
        );
        Ok(Self {
            migration_id: header.migration_id,
            started: Instant::now(),
            flush_interval: flush_interval.max(1),
            store,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Trail backed by a fresh [`MemoryAuditStore`], flushing every entry.
    pub fn in_memory(migration_id: impl Into<String>) -> (Self, Arc<MemoryAuditStore>) {
        let migration_id = migration_id.into();
        let store = Arc::new(MemoryAuditStore::new());
        store.push(AuditLine::Header(AuditHeader {
            migration_id: migration_id.clone(),
            scope: String::new(),
            started_at: Utc::now(),
            date_from: None,
            date_to: None,
            dry_run: false,
            settings: Value::Null,
        }));
        let trail = Self {
            migration_id,
            started: Instant::now(),
            flush_interval: 1,
            store: store.clone(),
            inner: Mutex::new(Inner::default()),
        };
        (trail, store)
    }

    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Begin an operation; it becomes the parent of operations started
    /// before it ends.
    pub fn start_operation(&self, op_type: &str, details: Value) -> String {
        let (op_id, parent) = {
            let mut inner = self.lock();
            inner.next_operation += 1;
            let op_id = format!("op-{:05}-{}", inner.next_operation, op_type);
            let parent = inner.stack.last().cloned();
            inner.active.insert(
                op_id.clone(),
                ActiveOperation {
                    op_type: op_type.to_string(),
                    parent: parent.clone(),
                    started: Instant::now(),
                },
            );
            inner.stack.push(op_id.clone());
            (op_id, parent)
        };

        self.log_event(
            "operation_started",
            json!({
                "operation_id": op_id,
                "operation_type": op_type,
                "parent_operation": parent,
                "details": details,
            }),
            Severity::Info,
        );
        op_id
    }

    /// Finish an operation, updating per-type statistics.
    pub fn end_operation(
        &self,
        op_id: &str,
        status: OperationStatus,
        result: Option<Value>,
        error: Option<&str>,
    ) {
        let finished = {
            let mut inner = self.lock();
            inner.stack.retain(|id| id != op_id);
            match inner.active.remove(op_id) {
                Some(op) => {
                    let duration = op.started.elapsed();
                    let stats = inner.stats.operations.entry(op.op_type.clone()).or_default();
                    stats.count += 1;
                    stats.total_duration_ms += duration.as_secs_f64() * 1000.0;
                    match status {
                        OperationStatus::Success | OperationStatus::Skipped => stats.success += 1,
                        OperationStatus::Failed => {
                            stats.failed += 1;
                            if let Some(message) = error {
                                if stats.errors.len() < MAX_ERROR_SAMPLES {
                                    stats.errors.push(message.to_string());
                                }
                            }
                        }
                    }
                    Some((op, duration))
                }
                None => None,
            }
        };

        let Some((op, duration)) = finished else {
            warn!("end_operation called for unknown operation {}", op_id);
            return;
        };

        let severity = match status {
            OperationStatus::Failed => Severity::Error,
            _ => Severity::Info,
        };
        self.log_event(
            "operation_completed",
            json!({
                "operation_id": op_id,
                "operation_type": op.op_type,
                "parent_operation": op.parent,
                "status": status,
                "duration_ms": duration.as_secs_f64() * 1000.0,
                "result": result,
                "error": error,
            }),
            severity,
        );
    }

    /// Run `fut` as an audited operation: failures are recorded with their
    /// message before being returned to the caller.
    pub async fn audited<T, Fut>(&self, op_type: &str, details: Value, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let op_id = self.start_operation(op_type, details);
        match fut.await {
            Ok(value) => {
                self.end_operation(&op_id, OperationStatus::Success, None, None);
                Ok(value)
            }
            Err(e) => {
                self.end_operation(
                    &op_id,
                    OperationStatus::Failed,
                    Some(json!({ "error_kind": e.kind() })),
                    Some(&e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Record a generic event.
    pub fn log_event(&self, event_type: &str, data: Value, severity: Severity) {
        let mut data = data;
        redact(&mut data);

        mirror_to_tracing(event_type, &data, severity);

        let mut inner = self.lock();
        inner.next_sequence += 1;
        let entry = AuditEntry {
            sequence: inner.next_sequence,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            severity,
            data,
            operation_context: inner.stack.clone(),
        };
        inner.stats.total_entries += 1;
        *inner.stats.events_by_severity.entry(severity).or_insert(0) += 1;
        inner.buffer.push(AuditLine::Entry(entry));

        if inner.buffer.len() >= self.flush_interval {
            self.flush_locked(&mut inner);
        }
    }

    pub fn log_record_created(&self, entity: EntityType, id: &str, doc: &Document) {
        self.lock().stats.records.created += 1;
        self.log_event(
            "record_created",
            json!({ "entity_type": entity, "record_id": id, "preview": preview(doc) }),
            Severity::Info,
        );
    }

    pub fn log_record_updated(&self, entity: EntityType, id: &str, changes: &Document) {
        self.lock().stats.records.updated += 1;
        let fields: Vec<&String> = changes.keys().collect();
        self.log_event(
            "record_updated",
            json!({ "entity_type": entity, "record_id": id, "changed_fields": fields }),
            Severity::Info,
        );
    }

    pub fn log_record_skipped(&self, entity: Option<EntityType>, reason: &str, doc: &Document) {
        {
            let mut inner = self.lock();
            inner.stats.records.skipped += 1;
            *inner
                .stats
                .records
                .skip_reasons
                .entry(reason.to_string())
                .or_insert(0) += 1;
        }
        self.log_event(
            "record_skipped",
            json!({ "entity_type": entity, "reason": reason, "preview": preview(doc) }),
            Severity::Info,
        );
    }

    /// A record that could not be written for a reason other than validation.
    pub fn log_record_failed(&self, entity: Option<EntityType>, error: &str, doc: &Document) {
        self.lock().stats.records.failed += 1;
        self.log_event(
            "record_failed",
            json!({ "entity_type": entity, "error": error, "preview": preview(doc) }),
            Severity::Error,
        );
    }

    pub fn log_validation_error(&self, entity: EntityType, issues: Value, doc: &Document) {
        self.lock().stats.records.validation_errors += 1;
        self.log_event(
            "validation_error",
            json!({ "entity_type": entity, "issues": issues, "preview": preview(doc) }),
            Severity::Warning,
        );
    }

    /// Record a source API call. Parameters are redacted before storage.
    pub fn log_api_call(
        &self,
        endpoint: &str,
        method: &str,
        params: Value,
        status: Option<u16>,
        duration: Duration,
        error: Option<&str>,
    ) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        {
            let mut inner = self.lock();
            inner.stats.records.api_calls += 1;
            inner.stats.records.api_total_duration_ms += duration_ms;
            if error.is_some() {
                inner.stats.records.api_errors += 1;
            }
        }
        let severity = if error.is_some() {
            Severity::Warning
        } else {
            Severity::Info
        };
        self.log_event(
            "api_call",
            json!({
                "endpoint": endpoint,
                "method": method,
                "params": params,
                "status": status,
                "duration_ms": duration_ms,
                "error": error,
            }),
            severity,
        );
    }

    pub fn log_duplicate_detected(
        &self,
        entity: EntityType,
        candidate_key: &str,
        matched_id: &str,
        strategy: &str,
        confidence: u8,
    ) {
        self.lock().stats.records.duplicates += 1;
        self.log_event(
            "duplicate_detected",
            json!({
                "entity_type": entity,
                "candidate_key": candidate_key,
                "matched_id": matched_id,
                "strategy": strategy,
                "confidence": confidence,
            }),
            Severity::Warning,
        );
    }

    pub fn log_batch_processed(&self, batch_number: usize, size: usize, stats: Value) {
        self.lock().stats.records.batches += 1;
        self.log_event(
            "batch_processed",
            json!({ "batch_number": batch_number, "batch_size": size, "statistics": stats }),
            Severity::Info,
        );
    }

    /// Rollbacks are always critical.
    pub fn log_rollback(&self, checkpoint_id: &str, reason: &str, report: Value) {
        self.lock().stats.records.rollbacks += 1;
        self.log_event(
            "rollback_performed",
            json!({ "checkpoint_id": checkpoint_id, "reason": reason, "report": report }),
            Severity::Critical,
        );
    }

    pub fn log_data_transformation(&self, kind: &str, original: &Value, transformed: &Value) {
        self.lock().stats.records.transformations += 1;
        self.log_event(
            "data_transformed",
            json!({
                "transformation": kind,
                "original": value_preview(original),
                "transformed": value_preview(transformed),
            }),
            Severity::Info,
        );
    }

    pub fn log_compliance_note(&self, category: &str, note: &str) {
        self.lock().stats.records.compliance_notes += 1;
        self.log_event(
            "compliance_note",
            json!({ "category": category, "note": note }),
            Severity::Info,
        );
    }

    /// Write buffered entries and a statistics line.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        self.write_buffer(&mut inner)
    }

    fn flush_locked(&self, inner: &mut Inner) {
        if let Err(e) = self.write_buffer(inner) {
            error!("Audit flush to {} failed: {}", self.store.location(), e);
        }
    }

    fn write_buffer(&self, inner: &mut Inner) -> Result<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }
        let mut lines = std::mem::take(&mut inner.buffer);
        lines.push(AuditLine::Statistics(inner.stats.clone()));
        match self.store.append(&lines) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Keep entries for the next attempt; drop the stale statistics line
                lines.pop();
                lines.append(&mut inner.buffer);
                inner.buffer = lines;
                Err(e)
            }
        }
    }

    /// Current rolling statistics.
    pub fn statistics(&self) -> AuditStatistics {
        self.lock().stats.clone()
    }

    /// Elapsed time since the trail started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Aggregate report with recommendations.
    pub fn generate_summary_report(&self) -> AuditSummary {
        AuditSummary::from_statistics(&self.migration_id, &self.statistics(), self.elapsed())
    }
}

/// Replace values of sensitive keys, recursively.
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                let lower = key.to_lowercase();
                if SENSITIVE_KEYS.iter().any(|k| lower.contains(k)) {
                    *inner = Value::String(REDACTED.to_string());
                } else {
                    redact(inner);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

/// Identifying fields of a document, truncated.
pub fn preview(doc: &Document) -> Value {
    let mut out = Map::new();
    for field in PREVIEW_FIELDS {
        if let Some(value) = doc.get(field) {
            if !value.is_null() {
                out.insert(field.to_string(), truncate_value(value));
            }
        }
    }
    Value::Object(out)
}

fn value_preview(value: &Value) -> Value {
    match value {
        Value::Object(map) => preview(map),
        other => truncate_value(other),
    }
}

fn truncate_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > PREVIEW_MAX_CHARS => {
            Value::String(s.chars().take(PREVIEW_MAX_CHARS).collect())
        }
        Value::Array(_) | Value::Object(_) => {
            let text = value.to_string();
            if text.chars().count() > PREVIEW_MAX_CHARS {
                Value::String(text.chars().take(PREVIEW_MAX_CHARS).collect())
            } else {
                value.clone()
            }
        }
        other => other.clone(),
    }
}

fn mirror_to_tracing(event_type: &str, data: &Value, severity: Severity) {
    match severity {
        Severity::Critical => error!(event = event_type, "CRITICAL audit event: {}", data),
        Severity::Error => error!(event = event_type, "{}", data),
        Severity::Warning => warn!(event = event_type, "{}", data),
        Severity::Info if event_type.starts_with("record_") || event_type == "api_call" => {
            debug!(event = event_type, "{}", data)
        }
        Severity::Info => info!(event = event_type, "{}", data),
    }
}
