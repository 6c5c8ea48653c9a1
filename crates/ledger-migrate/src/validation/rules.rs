//! Composable validation rules.

use crate::core::{doc_date, doc_decimal, doc_rows, doc_str, Document, EntityType, Severity};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Tolerance for debit/credit balance of compound entries.
pub const BALANCE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Description length accepted by the target without truncation.
pub const MAX_DESCRIPTION_LEN: usize = 140;

/// Issue type reported for a compound entry whose debits and credits differ.
pub const UNBALANCED_ENTRY: &str = "unbalanced_entry";

/// One failed rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn new(
        field: impl Into<String>,
        issue_type: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            field: field.into(),
            issue_type: issue_type.into(),
            message: message.into(),
            severity,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity >= Severity::Error
    }
}

/// Answers whether a referenced record exists.
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn exists(&self, entity: EntityType, id: &str) -> Result<bool>;
}

/// A single check on a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Required {
        field: &'static str,
    },
    MaxLength {
        field: &'static str,
        max: usize,
    },
    ValidDate {
        field: &'static str,
    },
    NumericRange {
        field: &'static str,
        min: Option<Decimal>,
        max: Option<Decimal>,
        severity: Severity,
    },
    /// `field` names a record of `entity`.
    Reference {
        field: &'static str,
        entity: EntityType,
    },
    /// Every row of `rows` names a record of `entity` in `field`.
    RowReference {
        rows: &'static str,
        field: &'static str,
        entity: EntityType,
    },
    /// Debits and credits of `rows` agree within [`BALANCE_TOLERANCE`].
    Balanced {
        rows: &'static str,
    },
}

impl Rule {
    /// Apply the rule. Reference rules consult the resolver.
    pub async fn check(
        &self,
        doc: &Document,
        resolver: &dyn ReferenceResolver,
    ) -> Result<Vec<ValidationIssue>> {
        let issues = match self {
            Rule::Required { field } => match doc.get(*field) {
                Some(value) if is_present(value) => vec![],
                _ => vec![ValidationIssue::new(
                    *field,
                    "missing_required_field",
                    format!("'{}' is required", field),
                    Severity::Error,
                )],
            },
            Rule::MaxLength { field, max } => match doc_str(doc, field) {
                Some(value) if value.chars().count() > *max => vec![ValidationIssue::new(
                    *field,
                    "max_length_exceeded",
                    format!(
                        "'{}' is {} characters, longer than {}",
                        field,
                        value.chars().count(),
                        max
                    ),
                    Severity::Warning,
                )],
                _ => vec![],
            },
            Rule::ValidDate { field } => match doc.get(*field) {
                Some(value) if !value.is_null() && doc_date(doc, field).is_none() => {
                    vec![ValidationIssue::new(
                        *field,
                        "invalid_date",
                        format!("'{}' is not a YYYY-MM-DD date: {}", field, value),
                        Severity::Error,
                    )]
                }
                _ => vec![],
            },
            Rule::NumericRange {
                field,
                min,
                max,
                severity,
            } => match doc.get(*field) {
                None => vec![],
                Some(value) if value.is_null() => vec![],
                Some(value) => match doc_decimal(doc, field) {
                    None => vec![ValidationIssue::new(
                        *field,
                        "invalid_number",
                        format!("'{}' is not numeric: {}", field, value),
                        Severity::Error,
                    )],
                    Some(n) if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) => {
                        vec![ValidationIssue::new(
                            *field,
                            "out_of_range",
                            format!("'{}' = {} is outside {}", field, n, describe_range(*min, *max)),
                            *severity,
                        )]
                    }
                    Some(_) => vec![],
                },
            },
            Rule::Reference { field, entity } => match doc_str(doc, field) {
                Some(id) => {
                    if resolver.exists(*entity, id).await? {
                        vec![]
                    } else {
                        vec![missing_reference(field, *entity, id)]
                    }
                }
                None => vec![],
            },
            Rule::RowReference { rows, field, entity } => {
                let mut issues = Vec::new();
                for (i, row) in doc_rows(doc, rows).into_iter().enumerate() {
                    let path = format!("{}[{}].{}", rows, i, field);
                    match doc_str(row, field) {
                        Some(id) => {
                            if !resolver.exists(*entity, id).await? {
                                issues.push(missing_reference(&path, *entity, id));
                            }
                        }
                        None => issues.push(ValidationIssue::new(
                            path.clone(),
                            "missing_required_field",
                            format!("'{}' is required", path),
                            Severity::Error,
                        )),
                    }
                }
                issues
            }
            Rule::Balanced { rows } => {
                let (debit, credit) = row_totals(doc, rows);
                let difference = (debit - credit).abs();
                if difference > BALANCE_TOLERANCE {
                    vec![ValidationIssue::new(
                        *rows,
                        UNBALANCED_ENTRY,
                        format!(
                            "debit {} and credit {} differ by {}",
                            debit, credit, difference
                        ),
                        Severity::Error,
                    )]
                } else {
                    vec![]
                }
            }
        };
        Ok(issues)
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

fn missing_reference(field: &str, entity: EntityType, id: &str) -> ValidationIssue {
    ValidationIssue::new(
        field,
        "missing_reference",
        format!("{} '{}' does not exist", entity, id),
        Severity::Error,
    )
}

fn describe_range(min: Option<Decimal>, max: Option<Decimal>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("[{}, {}]", lo, hi),
        (Some(lo), None) => format!(">= {}", lo),
        (None, Some(hi)) => format!("<= {}", hi),
        (None, None) => "any".to_string(),
    }
}

/// Sum of `debit` and `credit` over the rows of a compound entry.
pub fn row_totals(doc: &Document, rows: &str) -> (Decimal, Decimal) {
    doc_rows(doc, rows)
        .into_iter()
        .fold((Decimal::ZERO, Decimal::ZERO), |(d, c), row| {
            (
                d + doc_decimal(row, "debit").unwrap_or_default(),
                c + doc_decimal(row, "credit").unwrap_or_default(),
            )
        })
}

/// Rules for each entity type.
#[derive(Debug, Clone, Default)]
pub struct RuleBook;

impl RuleBook {
    pub fn rules(&self, entity: EntityType) -> Vec<Rule> {
        let positive = |field| Rule::NumericRange {
            field,
            min: Some(Decimal::ZERO),
            max: None,
            severity: Severity::Warning,
        };
        let mut rules = Vec::new();

        if let Some(date) = entity.date_field() {
            rules.push(Rule::Required { field: date });
            rules.push(Rule::ValidDate { field: date });
        }

        match entity {
            EntityType::SalesInvoice | EntityType::PurchaseInvoice => {
                let (party, party_entity, account) = if entity == EntityType::SalesInvoice {
                    ("customer", EntityType::Customer, "debit_to")
                } else {
                    ("supplier", EntityType::Supplier, "credit_to")
                };
                rules.extend([
                    Rule::Required { field: party },
                    Rule::Reference {
                        field: party,
                        entity: party_entity,
                    },
                    Rule::Required { field: "grand_total" },
                    positive("grand_total"),
                    Rule::Required { field: account },
                    Rule::Reference {
                        field: account,
                        entity: EntityType::Account,
                    },
                    Rule::RowReference {
                        rows: "items",
                        field: "account",
                        entity: EntityType::Account,
                    },
                ]);
            }
            EntityType::PaymentEntry => {
                rules.extend([
                    Rule::Required { field: "party" },
                    Rule::Required { field: "party_type" },
                    Rule::Required { field: "paid_amount" },
                    Rule::NumericRange {
                        field: "paid_amount",
                        min: Some(BALANCE_TOLERANCE),
                        max: None,
                        severity: Severity::Error,
                    },
                    Rule::Required { field: "paid_from" },
                    Rule::Reference {
                        field: "paid_from",
                        entity: EntityType::Account,
                    },
                    Rule::Required { field: "paid_to" },
                    Rule::Reference {
                        field: "paid_to",
                        entity: EntityType::Account,
                    },
                ]);
            }
            EntityType::JournalEntry => {
                rules.extend([
                    Rule::Required { field: "accounts" },
                    Rule::RowReference {
                        rows: "accounts",
                        field: "account",
                        entity: EntityType::Account,
                    },
                    Rule::Balanced { rows: "accounts" },
                ]);
            }
            EntityType::Customer | EntityType::Supplier | EntityType::Account => {
                rules.push(Rule::Required {
                    field: entity.title_field(),
                });
                rules.push(Rule::MaxLength {
                    field: entity.title_field(),
                    max: MAX_DESCRIPTION_LEN,
                });
            }
        }

        if entity.is_submittable() {
            rules.push(Rule::MaxLength {
                field: "description",
                max: MAX_DESCRIPTION_LEN,
            });
        }
        rules
    }
}
