//! Aggregate summaries of an audit trail.

use super::AuditStatistics;
use crate::core::{percentage, Priority, Recommendation, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Failure percentage above which the run is flagged.
const FAILURE_RATE_THRESHOLD: f64 = 5.0;

/// Duplicate count above which the source data is flagged.
const DUPLICATE_THRESHOLD: u64 = 10;

/// Average operation duration (ms) above which batch sizing is flagged.
const SLOW_OPERATION_MS: f64 = 5_000.0;

/// Records by outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordTotals {
    pub total: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub validation_errors: u64,
    pub duplicates: u64,
    pub failure_rate: f64,
}

/// Per-operation-type aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSummary {
    pub count: u64,
    pub success: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// Errors grouped by operation type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub count: u64,
    pub samples: Vec<String>,
}

/// Source API usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiTotals {
    pub calls: u64,
    pub errors: u64,
    pub avg_duration_ms: f64,
}

/// Aggregate report of a trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSummary {
    pub migration_id: String,
    pub generated_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub total_events: u64,
    pub records: RecordTotals,
    pub skip_reasons: BTreeMap<String, u64>,
    pub operations: BTreeMap<String, OperationSummary>,
    pub error_summary: BTreeMap<String, ErrorSummary>,
    pub api: ApiTotals,
    pub batches: u64,
    pub rollbacks: u64,
    pub events_by_severity: BTreeMap<Severity, u64>,
    pub recommendations: Vec<Recommendation>,
}

impl AuditSummary {
    pub fn from_statistics(migration_id: &str, stats: &AuditStatistics, elapsed: Duration) -> Self {
        let r = &stats.records;
        let total = r.created + r.updated + r.skipped + r.failed + r.validation_errors;
        let failed = r.failed + r.validation_errors;
        let records = RecordTotals {
            total,
            created: r.created,
            updated: r.updated,
            skipped: r.skipped,
            failed: r.failed,
            validation_errors: r.validation_errors,
            duplicates: r.duplicates,
            failure_rate: percentage(failed as usize, total as usize),
        };

        let operations: BTreeMap<String, OperationSummary> = stats
            .operations
            .iter()
            .map(|(op_type, s)| {
                let avg = if s.count > 0 {
                    s.total_duration_ms / s.count as f64
                } else {
                    0.0
                };
                (
                    op_type.clone(),
                    OperationSummary {
                        count: s.count,
                        success: s.success,
                        failed: s.failed,
                        success_rate: percentage(s.success as usize, s.count as usize),
                        avg_duration_ms: avg,
                    },
                )
            })
            .collect();

        let error_summary = stats
            .operations
            .iter()
            .filter(|(_, s)| s.failed > 0)
            .map(|(op_type, s)| {
                (
                    op_type.clone(),
                    ErrorSummary {
                        count: s.failed,
                        samples: s.errors.clone(),
                    },
                )
            })
            .collect();

        let api = ApiTotals {
            calls: r.api_calls,
            errors: r.api_errors,
            avg_duration_ms: if r.api_calls > 0 {
                r.api_total_duration_ms / r.api_calls as f64
            } else {
                0.0
            },
        };

        let recommendations = recommendations(&records, &operations);

        Self {
            migration_id: migration_id.to_string(),
            generated_at: Utc::now(),
            duration_secs: elapsed.as_secs_f64(),
            total_events: stats.total_entries,
            records,
            skip_reasons: r.skip_reasons.clone(),
            operations,
            error_summary,
            api,
            batches: r.batches,
            rollbacks: r.rollbacks,
            events_by_severity: stats.events_by_severity.clone(),
            recommendations,
        }
    }
}

fn recommendations(
    records: &RecordTotals,
    operations: &BTreeMap<String, OperationSummary>,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    if records.failure_rate > FAILURE_RATE_THRESHOLD {
        out.push(Recommendation::new(
            Priority::High,
            "data_quality",
            format!(
                "Failure rate is {:.1}%; review validation errors before re-running",
                records.failure_rate
            ),
        ));
    }

    if records.duplicates > DUPLICATE_THRESHOLD {
        out.push(Recommendation::new(
            Priority::Medium,
            "duplicates",
            format!(
                "{} duplicates detected; check whether the source was imported before",
                records.duplicates
            ),
        ));
    }

    if records.validation_errors > 0 {
        out.push(Recommendation::new(
            Priority::Medium,
            "validation",
            format!(
                "{} records failed validation; fix master data or account mappings",
                records.validation_errors
            ),
        ));
    }

    for (op_type, op) in operations {
        if op.avg_duration_ms > SLOW_OPERATION_MS {
            out.push(Recommendation::new(
                Priority::Low,
                "performance",
                format!(
                    "'{}' averages {:.1}s; consider batch size optimization",
                    op_type,
                    op.avg_duration_ms / 1000.0
                ),
            ));
        }
    }

    out
}
