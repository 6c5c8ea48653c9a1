//! Dry-run simulation: validation and financial impact without persisting.
//!
//! The simulator applies the same [`RuleBook`] as a real import. References
//! resolve against the target and against records simulated earlier in the
//! same run, so a simulated customer satisfies a later simulated invoice.

use crate::core::{
    doc_decimal, doc_rows, doc_str, percentage, Document, EntityType, Priority, Recommendation,
    TargetSystem,
};
use crate::error::Result;
use crate::validation::{apply_rules, row_totals, ReferenceResolver, RuleBook, ValidationIssue, BALANCE_TOLERANCE};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Errors and warnings kept in the report.
pub const MAX_REPORTED_ISSUES: usize = 50;

const HIGH_FAILURE_PCT: f64 = 10.0;

/// Ledger effect of one simulated record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialImpact {
    pub debit: Decimal,
    pub credit: Decimal,
    pub accounts: Vec<String>,
    pub parties: Vec<String>,
    pub creates_ledger_entries: bool,
}

impl FinancialImpact {
    pub fn of(entity: EntityType, doc: &Document) -> Self {
        let mut impact = FinancialImpact::default();
        let account = |field: &str, impact: &mut FinancialImpact| {
            if let Some(a) = doc_str(doc, field) {
                impact.accounts.push(a.to_string());
            }
        };
        match entity {
            EntityType::SalesInvoice | EntityType::PurchaseInvoice => {
                let total = doc_decimal(doc, "grand_total").unwrap_or_default();
                impact.debit = total;
                impact.credit = total;
                let ledger = if entity == EntityType::SalesInvoice {
                    "debit_to"
                } else {
                    "credit_to"
                };
                account(ledger, &mut impact);
                for row in doc_rows(doc, "items") {
                    if let Some(a) = doc_str(row, "account") {
                        impact.accounts.push(a.to_string());
                    }
                }
            }
            EntityType::PaymentEntry => {
                let amount = doc_decimal(doc, "paid_amount").unwrap_or_default();
                impact.debit = amount;
                impact.credit = amount;
                account("paid_from", &mut impact);
                account("paid_to", &mut impact);
            }
            EntityType::JournalEntry => {
                let (debit, credit) = row_totals(doc, "accounts");
                impact.debit = debit;
                impact.credit = credit;
                for row in doc_rows(doc, "accounts") {
                    if let Some(a) = doc_str(row, "account") {
                        impact.accounts.push(a.to_string());
                    }
                    if let Some(p) = doc_str(row, "party") {
                        impact.parties.push(p.to_string());
                    }
                }
            }
            EntityType::Customer | EntityType::Supplier | EntityType::Account => {}
        }
        if let Some(party) = entity.party_field().and_then(|f| doc_str(doc, f)) {
            impact.parties.push(party.to_string());
        }
        impact.accounts.dedup();
        impact.creates_ledger_entries =
            entity.is_submittable() && (impact.debit > Decimal::ZERO || impact.credit > Decimal::ZERO);
        impact
    }
}

/// Outcome of one simulated create. Validation failures are
/// reported here, never as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub success: bool,
    pub simulated_name: Option<String>,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub impact: Option<FinancialImpact>,
}

/// Would-be counters of one entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationCounts {
    pub would_create: u64,
    pub would_skip: u64,
    pub would_fail: u64,
}

impl SimulationCounts {
    fn total(&self) -> u64 {
        self.would_create + self.would_skip + self.would_fail
    }
}

/// A simulated record whose issues made it into the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedIssue {
    pub entity: EntityType,
    pub record: String,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunSummary {
    pub total_records_analyzed: u64,
    pub would_succeed: u64,
    pub would_fail: u64,
    pub would_skip: u64,
    pub validation_errors: usize,
}

/// Aggregate ledger effect of all successful simulations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactSummary {
    pub total_debit: Decimal,
    pub total_credit: Decimal,
    /// Debit minus credit; approximately zero for a consistent import.
    pub balance: Decimal,
    pub accounts_affected: usize,
    pub parties_affected: usize,
    pub ledger_entries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunReport {
    pub summary: DryRunSummary,
    pub statistics: BTreeMap<EntityType, SimulationCounts>,
    pub financial_impact: ImpactSummary,
    pub validation_errors: Vec<ReportedIssue>,
    pub warnings: Vec<ReportedIssue>,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone)]
struct SimulatedRecord {
    name: String,
    title: Option<String>,
}

#[derive(Default)]
struct SimulationState {
    simulated: HashMap<EntityType, Vec<SimulatedRecord>>,
    statistics: BTreeMap<EntityType, SimulationCounts>,
    total_debit: Decimal,
    total_credit: Decimal,
    accounts: BTreeSet<String>,
    parties: BTreeSet<String>,
    ledger_entries: u64,
    error_count: usize,
    errors: Vec<ReportedIssue>,
    warnings: Vec<ReportedIssue>,
    missing_references: u64,
}

impl SimulationState {
    fn counts(&mut self, entity: EntityType) -> &mut SimulationCounts {
        self.statistics.entry(entity).or_default()
    }

    fn contains(&self, entity: EntityType, id: &str) -> bool {
        self.simulated.get(&entity).is_some_and(|records| {
            records
                .iter()
                .any(|r| r.name == id || r.title.as_deref() == Some(id))
        })
    }

    fn report_issues(&mut self, entity: EntityType, record: &str, errors: &[ValidationIssue], warnings: &[ValidationIssue]) {
        if !errors.is_empty() {
            self.error_count += 1;
            self.missing_references += errors
                .iter()
                .filter(|i| i.issue_type == "missing_reference")
                .count() as u64;
            if self.errors.len() < MAX_REPORTED_ISSUES {
                self.errors.push(ReportedIssue {
                    entity,
                    record: record.to_string(),
                    issues: errors.to_vec(),
                });
            }
        }
        if !warnings.is_empty() && self.warnings.len() < MAX_REPORTED_ISSUES {
            self.warnings.push(ReportedIssue {
                entity,
                record: record.to_string(),
                issues: warnings.to_vec(),
            });
        }
    }
}

/// Simulates creates against a read-only view of the target.
pub struct DryRunSimulator {
    target: Arc<dyn TargetSystem>,
    rules: RuleBook,
    state: Mutex<SimulationState>,
}

impl DryRunSimulator {
    pub fn new(target: Arc<dyn TargetSystem>) -> Self {
        Self {
            target,
            rules: RuleBook,
            state: Mutex::new(SimulationState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimulationState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Validate `data` as if creating it, and record its impact when valid.
    pub async fn simulate_record_creation(&self, entity: EntityType, data: &Document) -> Result<SimulationOutcome> {
        let result = apply_rules(&self.rules, entity, data, self).await?;
        let errors: Vec<ValidationIssue> = result.errors().cloned().collect();
        let warnings: Vec<ValidationIssue> = result.warnings().cloned().collect();

        let mut state = self.state();
        if !errors.is_empty() {
            state.counts(entity).would_fail += 1;
            let label = record_label(entity, data);
            state.report_issues(entity, &label, &errors, &warnings);
            debug!("Dry run: {} {} would fail", entity, label);
            return Ok(SimulationOutcome {
                success: false,
                simulated_name: None,
                errors,
                warnings,
                impact: None,
            });
        }

        let count = state.simulated.get(&entity).map_or(0, Vec::len);
        let name = format!("SIM-{}-{}", entity, count);
        let title = doc_str(data, entity.title_field()).map(str::to_string);
        state
            .simulated
            .entry(entity)
            .or_default()
            .push(SimulatedRecord {
                name: doc_str(data, "name").map(str::to_string).unwrap_or_else(|| name.clone()),
                title,
            });
        state.counts(entity).would_create += 1;
        state.report_issues(entity, &name, &[], &warnings);

        let impact = FinancialImpact::of(entity, data);
        state.total_debit += impact.debit;
        state.total_credit += impact.credit;
        state.accounts.extend(impact.accounts.iter().cloned());
        state.parties.extend(impact.parties.iter().cloned());
        if impact.creates_ledger_entries {
            state.ledger_entries += 1;
        }

        Ok(SimulationOutcome {
            success: true,
            simulated_name: Some(name),
            errors,
            warnings,
            impact: Some(impact),
        })
    }

    /// Count a record the import would skip (duplicate or unknown type).
    pub fn record_skip(&self, entity: EntityType) {
        self.state().counts(entity).would_skip += 1;
    }

    /// Count a record that fails before validation, e.g. because no target
    /// document could be built for it.
    pub fn record_failure(&self, entity: EntityType, record: &str, issue: ValidationIssue) {
        let mut state = self.state();
        state.counts(entity).would_fail += 1;
        state.report_issues(entity, record, std::slice::from_ref(&issue), &[]);
    }

    pub fn generate_dry_run_report(&self) -> DryRunReport {
        let state = self.state();
        let totals = state
            .statistics
            .values()
            .fold(SimulationCounts::default(), |mut acc, c| {
                acc.would_create += c.would_create;
                acc.would_skip += c.would_skip;
                acc.would_fail += c.would_fail;
                acc
            });
        let balance = state.total_debit - state.total_credit;

        let mut recommendations = Vec::new();
        let analyzed = totals.total();
        let failure_rate = percentage(totals.would_fail as usize, analyzed as usize);
        if analyzed == 0 {
            recommendations.push(Recommendation::new(
                Priority::Info,
                "empty_run",
                "No records were processed; check the date range and source connection",
            ));
        }
        if failure_rate > HIGH_FAILURE_PCT {
            recommendations.push(Recommendation::new(
                Priority::High,
                "data_quality",
                format!("{:.1}% of records would fail; resolve validation errors first", failure_rate),
            ));
        }
        if state.missing_references > 0 {
            recommendations.push(Recommendation::new(
                Priority::Medium,
                "master_data",
                format!(
                    "{} missing references; import parties and accounts before transactions",
                    state.missing_references
                ),
            ));
        }
        if balance.abs() > BALANCE_TOLERANCE {
            recommendations.push(Recommendation::new(
                Priority::High,
                "ledger_balance",
                format!("Simulated ledger impact is unbalanced by {}", balance),
            ));
        }

        let report = DryRunReport {
            summary: DryRunSummary {
                total_records_analyzed: analyzed,
                would_succeed: totals.would_create,
                would_fail: totals.would_fail,
                would_skip: totals.would_skip,
                validation_errors: state.error_count,
            },
            statistics: state.statistics.clone(),
            financial_impact: ImpactSummary {
                total_debit: state.total_debit,
                total_credit: state.total_credit,
                balance,
                accounts_affected: state.accounts.len(),
                parties_affected: state.parties.len(),
                ledger_entries: state.ledger_entries,
            },
            validation_errors: state.errors.clone(),
            warnings: state.warnings.clone(),
            recommendations,
        };
        info!(
            "Dry run: {} analyzed, {} would succeed, {} would fail, balance {}",
            report.summary.total_records_analyzed,
            report.summary.would_succeed,
            report.summary.would_fail,
            balance
        );
        report
    }
}

#[async_trait]
impl ReferenceResolver for DryRunSimulator {
    async fn exists(&self, entity: EntityType, id: &str) -> Result<bool> {
        if self.state().contains(entity, id) {
            return Ok(true);
        }
        Ok(self.target.get(entity, id).await?.is_some())
    }
}

fn record_label(entity: EntityType, doc: &Document) -> String {
    ["external_id", "reference_no", "name", entity.title_field()]
        .iter()
        .find_map(|f| doc_str(doc, f))
        .map(str::to_string)
        .unwrap_or_else(|| format!("unnamed {}", entity))
}
