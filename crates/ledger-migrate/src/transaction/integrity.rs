//! Post-migration integrity checks.

use crate::core::{
    doc_decimal, doc_rows, doc_str, docstatus, Document, EntityType, Filter, TargetSystem,
    DOCSTATUS_CANCELLED,
};
use crate::error::Result;
use crate::validation::{row_totals, BALANCE_TOLERANCE, UNBALANCED_ENTRY};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

/// Required-field issues reported per entity type.
const MAX_FIELD_ISSUES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Passed,
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub entity: EntityType,
    pub record: String,
    pub detail: String,
}

impl IntegrityIssue {
    fn new(issue_type: &str, entity: EntityType, record: &str, detail: String) -> Self {
        Self {
            issue_type: issue_type.to_string(),
            entity,
            record: record.to_string(),
            detail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub check: String,
    pub passed: bool,
    /// Status contributed to the report when the check fails.
    pub severity: IntegrityStatus,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityCheck {
    fn new(check: &str, severity: IntegrityStatus, issues: Vec<IntegrityIssue>) -> Self {
        Self {
            check: check.to_string(),
            passed: issues.is_empty(),
            severity,
            issues,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub timestamp: DateTime<Utc>,
    pub status: IntegrityStatus,
    pub checks: Vec<IntegrityCheck>,
    pub total_issues: usize,
}

impl IntegrityReport {
    pub fn passed(&self) -> bool {
        self.status != IntegrityStatus::Failed
    }

    pub fn issues(&self) -> impl Iterator<Item = &IntegrityIssue> {
        self.checks.iter().flat_map(|c| c.issues.iter())
    }
}

/// Live (not cancelled) transactions in scope, per entity type.
async fn load_transactions(
    target: &dyn TargetSystem,
    scope: &Filter,
) -> Result<BTreeMap<EntityType, Vec<Document>>> {
    let mut loaded = BTreeMap::new();
    for entity in EntityType::TRANSACTIONS {
        let docs: Vec<Document> = target
            .query(entity, scope)
            .await?
            .into_iter()
            .filter(|d| docstatus(d) != DOCSTATUS_CANCELLED)
            .collect();
        loaded.insert(entity, docs);
    }
    Ok(loaded)
}

fn name_of(doc: &Document) -> &str {
    doc_str(doc, "name").unwrap_or("?")
}

/// Run the balance, referential, duplicate and required-field checks over
/// transactions matching `scope`. Balance and referential problems fail the
/// report; duplicates and missing fields only warn.
pub async fn verify_data_integrity(target: &dyn TargetSystem, scope: &Filter) -> Result<IntegrityReport> {
    let docs = load_transactions(target, scope).await?;

    let checks = vec![
        IntegrityCheck::new("balance", IntegrityStatus::Failed, check_balance(&docs)),
        IntegrityCheck::new(
            "referential_integrity",
            IntegrityStatus::Failed,
            check_references(target, &docs).await?,
        ),
        IntegrityCheck::new("duplicate_references", IntegrityStatus::Warning, check_duplicates(&docs)),
        IntegrityCheck::new("required_fields", IntegrityStatus::Warning, check_required(&docs)),
    ];

    let status = checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.severity)
        .max()
        .unwrap_or(IntegrityStatus::Passed);
    let total_issues = checks.iter().map(|c| c.issues.len()).sum();
    if status == IntegrityStatus::Passed {
        info!("Integrity verification passed");
    } else {
        warn!("Integrity verification {:?}: {} issues", status, total_issues);
    }
    Ok(IntegrityReport {
        timestamp: Utc::now(),
        status,
        checks,
        total_issues,
    })
}

fn check_balance(docs: &BTreeMap<EntityType, Vec<Document>>) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    for (entity, records) in docs {
        for doc in records {
            let difference = match entity {
                EntityType::JournalEntry => {
                    let (debit, credit) = row_totals(doc, "accounts");
                    debit - credit
                }
                EntityType::SalesInvoice | EntityType::PurchaseInvoice => {
                    let items = doc_rows(doc, "items");
                    if items.is_empty() || items.iter().any(|i| doc_decimal(i, "amount").is_none()) {
                        continue;
                    }
                    let lines: Decimal = items.iter().filter_map(|i| doc_decimal(i, "amount")).sum();
                    doc_decimal(doc, "grand_total").unwrap_or_default() - lines
                }
                _ => continue,
            };
            if difference.abs() > BALANCE_TOLERANCE {
                issues.push(IntegrityIssue::new(
                    UNBALANCED_ENTRY,
                    *entity,
                    name_of(doc),
                    format!("difference {}", difference),
                ));
            }
        }
    }
    issues
}

async fn check_references(
    target: &dyn TargetSystem,
    docs: &BTreeMap<EntityType, Vec<Document>>,
) -> Result<Vec<IntegrityIssue>> {
    let mut known: HashMap<(EntityType, String), bool> = HashMap::new();
    let mut issues = Vec::new();

    for (entity, records) in docs {
        for doc in records {
            let mut references: Vec<(EntityType, String, &str)> = Vec::new();
            match entity {
                EntityType::SalesInvoice => {
                    if let Some(c) = doc_str(doc, "customer") {
                        references.push((EntityType::Customer, c.to_string(), "missing_party"));
                    }
                }
                EntityType::PurchaseInvoice => {
                    if let Some(s) = doc_str(doc, "supplier") {
                        references.push((EntityType::Supplier, s.to_string(), "missing_party"));
                    }
                }
                EntityType::PaymentEntry => {
                    let party_entity = doc_str(doc, "party_type").and_then(|t| t.parse::<EntityType>().ok());
                    if let (Some(party_entity), Some(party)) = (party_entity, doc_str(doc, "party")) {
                        references.push((party_entity, party.to_string(), "missing_party"));
                    }
                    for row in doc_rows(doc, "references") {
                        let kind = doc_str(row, "reference_type").and_then(|t| t.parse::<EntityType>().ok());
                        if let (Some(kind), Some(name)) = (kind, doc_str(row, "reference_name")) {
                            references.push((kind, name.to_string(), "orphaned_payment_reference"));
                        }
                    }
                }
                _ => {}
            }

            for (ref_entity, id, issue_type) in references {
                let key = (ref_entity, id.clone());
                let exists = match known.get(&key) {
                    Some(exists) => *exists,
                    None => {
                        let exists = target.get(ref_entity, &id).await?.is_some();
                        known.insert(key, exists);
                        exists
                    }
                };
                if !exists {
                    issues.push(IntegrityIssue::new(
                        issue_type,
                        *entity,
                        name_of(doc),
                        format!("{} '{}' does not exist", ref_entity, id),
                    ));
                }
            }
        }
    }
    Ok(issues)
}

fn check_duplicates(docs: &BTreeMap<EntityType, Vec<Document>>) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    for (entity, records) in docs {
        let mut seen: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for doc in records {
            if let Some(external_id) = doc_str(doc, "external_id") {
                seen.entry(external_id).or_default().push(name_of(doc));
            }
        }
        for (external_id, names) in seen.into_iter().filter(|(_, n)| n.len() > 1) {
            issues.push(IntegrityIssue::new(
                "duplicate_external_reference",
                *entity,
                names[0],
                format!("external_id {} appears {} times: {}", external_id, names.len(), names.join(", ")),
            ));
        }
    }
    issues
}

fn check_required(docs: &BTreeMap<EntityType, Vec<Document>>) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    for (entity, records) in docs {
        let required: Vec<&str> = entity.party_field().into_iter().chain(entity.date_field()).collect();
        let mut reported = 0;
        for doc in records {
            if reported >= MAX_FIELD_ISSUES {
                break;
            }
            if let Some(missing) = required.iter().find(|f| doc_str(doc, f).is_none()) {
                issues.push(IntegrityIssue::new(
                    "missing_required_field",
                    *entity,
                    name_of(doc),
                    format!("'{}' is empty", missing),
                ));
                reported += 1;
            }
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::InMemoryTarget;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn seeded() -> InMemoryTarget {
        let target = InMemoryTarget::new();
        target.insert(EntityType::Customer, "CUST-1", doc(json!({"customer_name": "Jansen"})));
        target
    }

    fn journal(name: &str, credit: &str) -> Document {
        doc(json!({
            "posting_date": "2024-01-10",
            "accounts": [
                {"account": "Bank", "debit": "100.00", "credit": "0"},
                {"account": "Sales", "debit": "0", "credit": credit},
            ],
            "external_id": name,
        }))
    }

    #[tokio::test]
    async fn test_clean_target_passes() {
        let target = seeded();
        target.insert(EntityType::JournalEntry, "JV-1", journal("M-1", "100"));
        target.insert(
            EntityType::SalesInvoice,
            "SINV-1",
            doc(json!({
                "customer": "CUST-1",
                "posting_date": "2024-01-11",
                "grand_total": "50",
                "items": [{"amount": "20"}, {"amount": "30.00"}],
            })),
        );
        let report = verify_data_integrity(&target, &Filter::new()).await.unwrap();
        assert_eq!(report.status, IntegrityStatus::Passed);
        assert_eq!(report.checks.len(), 4);
        assert_eq!(report.total_issues, 0);
    }

    #[tokio::test]
    async fn test_unbalanced_entry_fails() {
        let target = seeded();
        target.insert(EntityType::JournalEntry, "JV-1", journal("M-1", "99.50"));
        let report = verify_data_integrity(&target, &Filter::new()).await.unwrap();
        assert_eq!(report.status, IntegrityStatus::Failed);
        let issue = report.issues().next().unwrap();
        assert_eq!(issue.issue_type, UNBALANCED_ENTRY);
        assert_eq!(issue.record, "JV-1");
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn test_orphaned_payment_reference_fails() {
        let target = seeded();
        target.insert(
            EntityType::PaymentEntry,
            "PE-1",
            doc(json!({
                "party_type": "customer",
                "party": "CUST-1",
                "posting_date": "2024-01-12",
                "references": [{"reference_type": "sales_invoice", "reference_name": "SINV-404"}],
            })),
        );
        let report = verify_data_integrity(&target, &Filter::new()).await.unwrap();
        assert_eq!(report.status, IntegrityStatus::Failed);
        let types: Vec<&str> = report.issues().map(|i| i.issue_type.as_str()).collect();
        assert_eq!(types, vec!["orphaned_payment_reference"]);
    }

    #[tokio::test]
    async fn test_duplicates_and_missing_fields_warn() {
        let target = seeded();
        target.insert(EntityType::JournalEntry, "JV-1", journal("M-7", "100"));
        target.insert(EntityType::JournalEntry, "JV-2", journal("M-7", "100"));
        target.insert(
            EntityType::SalesInvoice,
            "SINV-1",
            doc(json!({"customer": "CUST-1", "grand_total": "5"})),
        );
        let report = verify_data_integrity(&target, &Filter::new()).await.unwrap();
        assert_eq!(report.status, IntegrityStatus::Warning);
        assert!(report.passed());
        let types: Vec<&str> = report.issues().map(|i| i.issue_type.as_str()).collect();
        assert_eq!(types, vec!["duplicate_external_reference", "missing_required_field"]);
    }

    #[tokio::test]
    async fn test_cancelled_and_out_of_scope_records_are_ignored() {
        let target = seeded();
        let mut cancelled = journal("M-1", "1");
        cancelled.insert("docstatus".into(), json!(2));
        target.insert(EntityType::JournalEntry, "JV-1", cancelled);
        let mut old = journal("M-2", "1");
        old.insert("posting_date".into(), json!("2023-06-01"));
        target.insert(EntityType::JournalEntry, "JV-2", old);

        let scope = Filter::new().between("posting_date", "2024-01-01", "2024-12-31");
        let report = verify_data_integrity(&target, &scope).await.unwrap();
        assert_eq!(report.status, IntegrityStatus::Passed);
    }
}
