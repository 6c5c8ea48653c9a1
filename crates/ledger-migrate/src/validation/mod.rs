//! Rule-based validation of records before any mutation.
//!
//! The same [`RuleBook`] backs the pre-import validator and the dry-run
//! simulator, so both reach the same verdict for the same document.

mod rules;

pub use rules::{
    row_totals, ReferenceResolver, Rule, RuleBook, ValidationIssue, BALANCE_TOLERANCE,
    MAX_DESCRIPTION_LEN, UNBALANCED_ENTRY,
};

use crate::core::{percentage, Document, EntityType, Priority, Recommendation, TargetSystem};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Failure percentage above which a high-priority recommendation is raised.
const HIGH_FAILURE_PCT: f64 = 10.0;

/// Occurrences after which an error type gets its own recommendation.
const RECURRING_ERROR_COUNT: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Passed,
    Warning,
    Failed,
}

/// Verdict for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub entity: EntityType,
    pub status: ValidationStatus,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn from_issues(entity: EntityType, issues: Vec<ValidationIssue>) -> Self {
        let status = if issues.iter().any(ValidationIssue::is_error) {
            ValidationStatus::Failed
        } else if issues.is_empty() {
            ValidationStatus::Passed
        } else {
            ValidationStatus::Warning
        };
        Self {
            entity,
            status,
            issues,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status != ValidationStatus::Failed
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| !i.is_error())
    }

    /// Semicolon-joined error messages.
    pub fn error_message(&self) -> String {
        self.errors()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Running counts over validated records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub warnings: u64,
    pub error_types: BTreeMap<String, u64>,
    pub warning_types: BTreeMap<String, u64>,
}

impl ValidationSummary {
    pub fn record(&mut self, result: &ValidationResult) {
        self.total += 1;
        match result.status {
            ValidationStatus::Passed => self.passed += 1,
            ValidationStatus::Warning => self.warnings += 1,
            ValidationStatus::Failed => self.failed += 1,
        }
        for issue in &result.issues {
            let tally = if issue.is_error() {
                &mut self.error_types
            } else {
                &mut self.warning_types
            };
            *tally.entry(issue.issue_type.clone()).or_insert(0) += 1;
        }
    }

    pub fn failure_rate(&self) -> f64 {
        percentage(self.failed as usize, self.total as usize)
    }

    /// Whether the failure rate is within `max_failure_pct`.
    pub fn can_proceed(&self, max_failure_pct: f64) -> bool {
        self.failure_rate() <= max_failure_pct
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        let mut out = Vec::new();
        let rate = self.failure_rate();
        if rate > HIGH_FAILURE_PCT {
            out.push(Recommendation::new(
                Priority::High,
                "data_quality",
                format!(
                    "{:.1}% of records fail validation; fix the source data before importing",
                    rate
                ),
            ));
        }
        for (issue_type, count) in &self.error_types {
            if *count > RECURRING_ERROR_COUNT {
                out.push(Recommendation::new(
                    Priority::Medium,
                    issue_type.clone(),
                    format!("{} x {}: {}", count, issue_type, remedy(issue_type)),
                ));
            }
        }
        out
    }
}

fn remedy(issue_type: &str) -> &'static str {
    match issue_type {
        "missing_reference" => "create the missing master data (parties, accounts) first",
        "missing_required_field" => "complete the account mapping or source fields",
        UNBALANCED_ENTRY => "review journal lines in the source system",
        "invalid_date" => "check the date format of the export",
        _ => "review the affected records",
    }
}

/// Validation report of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchValidation {
    pub results: Vec<ValidationResult>,
    pub summary: ValidationSummary,
    pub recommendations: Vec<Recommendation>,
}

/// Resolves references against the target system.
pub struct TargetResolver {
    target: Arc<dyn TargetSystem>,
}

impl TargetResolver {
    pub fn new(target: Arc<dyn TargetSystem>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl ReferenceResolver for TargetResolver {
    async fn exists(&self, entity: EntityType, id: &str) -> Result<bool> {
        Ok(self.target.get(entity, id).await?.is_some())
    }
}

/// Apply every rule for `entity` to `doc`.
pub async fn apply_rules(
    rules: &RuleBook,
    entity: EntityType,
    doc: &Document,
    resolver: &dyn ReferenceResolver,
) -> Result<ValidationResult> {
    let mut issues = Vec::new();
    for rule in rules.rules(entity) {
        issues.extend(rule.check(doc, resolver).await?);
    }
    Ok(ValidationResult::from_issues(entity, issues))
}

/// Validates records and keeps running counts across calls.
pub struct PreImportValidator {
    rules: RuleBook,
    resolver: Arc<dyn ReferenceResolver>,
    summary: Mutex<ValidationSummary>,
}

impl PreImportValidator {
    pub fn new(resolver: Arc<dyn ReferenceResolver>) -> Self {
        Self {
            rules: RuleBook,
            resolver,
            summary: Mutex::new(ValidationSummary::default()),
        }
    }

    /// Validator resolving references in `target`.
    pub fn for_target(target: Arc<dyn TargetSystem>) -> Self {
        Self::new(Arc::new(TargetResolver::new(target)))
    }

    pub async fn validate_record(&self, entity: EntityType, doc: &Document) -> Result<ValidationResult> {
        let result = apply_rules(&self.rules, entity, doc, self.resolver.as_ref()).await?;
        if !result.is_valid() {
            debug!("{} failed validation: {}", entity, result.error_message());
        }
        self.summary
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record(&result);
        Ok(result)
    }

    pub async fn validate_batch(&self, records: &[(EntityType, Document)]) -> Result<BatchValidation> {
        let mut results = Vec::with_capacity(records.len());
        let mut summary = ValidationSummary::default();
        for (entity, doc) in records {
            let result = self.validate_record(*entity, doc).await?;
            summary.record(&result);
            results.push(result);
        }
        info!(
            "Validated {} records: {} passed, {} warnings, {} failed",
            summary.total, summary.passed, summary.warnings, summary.failed
        );
        let recommendations = summary.recommendations();
        Ok(BatchValidation {
            results,
            summary,
            recommendations,
        })
    }

    /// Counts over every record validated so far.
    pub fn summary(&self) -> ValidationSummary {
        self.summary
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
