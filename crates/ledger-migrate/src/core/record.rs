//! Records as fetched from the source API and documents as stored in the target.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A target-system document: a flat JSON object with optional child tables.
pub type Document = serde_json::Map<String, Value>;

/// Document status of a draft record.
pub const DOCSTATUS_DRAFT: i64 = 0;
/// Document status of a submitted (finalized) record.
pub const DOCSTATUS_SUBMITTED: i64 = 1;
/// Document status of a cancelled record.
pub const DOCSTATUS_CANCELLED: i64 = 2;

/// Entity types known to the target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    SalesInvoice,
    PurchaseInvoice,
    PaymentEntry,
    JournalEntry,
    Customer,
    Supplier,
    Account,
}

impl EntityType {
    /// Transactional entity types written by an import.
    pub const TRANSACTIONS: [EntityType; 4] = [
        EntityType::SalesInvoice,
        EntityType::PurchaseInvoice,
        EntityType::PaymentEntry,
        EntityType::JournalEntry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::SalesInvoice => "sales_invoice",
            EntityType::PurchaseInvoice => "purchase_invoice",
            EntityType::PaymentEntry => "payment_entry",
            EntityType::JournalEntry => "journal_entry",
            EntityType::Customer => "customer",
            EntityType::Supplier => "supplier",
            EntityType::Account => "account",
        }
    }

    /// Whether records of this type are finalized (submitted) after creation.
    pub fn is_submittable(&self) -> bool {
        Self::TRANSACTIONS.contains(self)
    }

    /// Field holding the monetary total used for matching and impact.
    pub fn amount_field(&self) -> Option<&'static str> {
        match self {
            EntityType::SalesInvoice | EntityType::PurchaseInvoice => Some("grand_total"),
            EntityType::PaymentEntry => Some("paid_amount"),
            EntityType::JournalEntry => Some("total_debit"),
            _ => None,
        }
    }

    /// Field referencing the counterparty, when the entity has one.
    pub fn party_field(&self) -> Option<&'static str> {
        match self {
            EntityType::SalesInvoice => Some("customer"),
            EntityType::PurchaseInvoice => Some("supplier"),
            EntityType::PaymentEntry => Some("party"),
            _ => None,
        }
    }

    /// Field holding the posting date of transactional entities.
    pub fn date_field(&self) -> Option<&'static str> {
        if self.is_submittable() {
            Some("posting_date")
        } else {
            None
        }
    }

    /// Field holding the human-readable title of master data.
    pub fn title_field(&self) -> &'static str {
        match self {
            EntityType::Customer => "customer_name",
            EntityType::Supplier => "supplier_name",
            EntityType::Account => "account_name",
            _ => "description",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sales_invoice" => Ok(EntityType::SalesInvoice),
            "purchase_invoice" => Ok(EntityType::PurchaseInvoice),
            "payment_entry" => Ok(EntityType::PaymentEntry),
            "journal_entry" => Ok(EntityType::JournalEntry),
            "customer" => Ok(EntityType::Customer),
            "supplier" => Ok(EntityType::Supplier),
            "account" => Ok(EntityType::Account),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

/// One ledger line of a source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordLine {
    pub account: String,
    #[serde(default)]
    pub debit: Decimal,
    #[serde(default)]
    pub credit: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A unit of data fetched from the source API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    /// Raw type tag as reported by the source.
    pub record_type: String,
    /// Stable identifier in the source system.
    pub external_id: String,
    pub posting_date: NaiveDate,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_reference: Option<String>,
    /// Invoice or bank reference number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Explicit ledger lines; only journal records carry them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<RecordLine>,
    /// External id of the invoice a payment settles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Money flow relative to the migrating company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Money or claims flowing in (sales, receipts).
    Incoming,
    /// Money or obligations flowing out (purchases, payments made).
    Outgoing,
}

/// A source record classified by what it means to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Invoice {
        direction: Direction,
        record: ExternalRecord,
    },
    Payment {
        direction: Direction,
        record: ExternalRecord,
    },
    JournalEntry {
        record: ExternalRecord,
    },
    Unknown {
        record: ExternalRecord,
    },
}

impl Mutation {
    /// Classify a source record by its type tag.
    ///
    /// Tags are compared case-insensitively with separators removed, so
    /// `sales_invoice`, `SalesInvoice` and `sales-invoice` are equivalent.
    pub fn classify(record: ExternalRecord) -> Self {
        let tag: String = record
            .record_type
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match tag.as_str() {
            "salesinvoice" | "invoicesent" | "factuurverstuurd" => Mutation::Invoice {
                direction: Direction::Incoming,
                record,
            },
            "purchaseinvoice" | "invoicereceived" | "factuurontvangen" => Mutation::Invoice {
                direction: Direction::Outgoing,
                record,
            },
            "paymentreceived" | "invoicepaymentreceived" | "factuurbetalingontvangen"
            | "moneyreceived" | "geldontvangen" => Mutation::Payment {
                direction: Direction::Incoming,
                record,
            },
            "paymentsent" | "paymentmade" | "invoicepaymentsent" | "factuurbetalingverstuurd"
            | "moneyspent" | "gelduitgegeven" => Mutation::Payment {
                direction: Direction::Outgoing,
                record,
            },
            "journalentry" | "journal" | "memoriaal" => Mutation::JournalEntry { record },
            _ => Mutation::Unknown { record },
        }
    }

    pub fn record(&self) -> &ExternalRecord {
        match self {
            Mutation::Invoice { record, .. }
            | Mutation::Payment { record, .. }
            | Mutation::JournalEntry { record }
            | Mutation::Unknown { record } => record,
        }
    }

    /// Target entity type, or None for unknown records.
    pub fn entity_type(&self) -> Option<EntityType> {
        match self {
            Mutation::Invoice {
                direction: Direction::Incoming,
                ..
            } => Some(EntityType::SalesInvoice),
            Mutation::Invoice {
                direction: Direction::Outgoing,
                ..
            } => Some(EntityType::PurchaseInvoice),
            Mutation::Payment { .. } => Some(EntityType::PaymentEntry),
            Mutation::JournalEntry { .. } => Some(EntityType::JournalEntry),
            Mutation::Unknown { .. } => None,
        }
    }
}

/// String field of a document.
pub fn doc_str<'a>(doc: &'a Document, field: &str) -> Option<&'a str> {
    match doc.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
        _ => None,
    }
}

/// Decimal field of a document; accepts JSON numbers and numeric strings.
pub fn doc_decimal(doc: &Document, field: &str) -> Option<Decimal> {
    doc.get(field).and_then(value_decimal)
}

/// Parse a JSON value as a decimal.
pub fn value_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Date field of a document in `YYYY-MM-DD` form.
pub fn doc_date(doc: &Document, field: &str) -> Option<NaiveDate> {
    doc_str(doc, field).and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

/// RFC 3339 timestamp field of a document.
pub fn doc_timestamp(doc: &Document, field: &str) -> Option<DateTime<Utc>> {
    doc_str(doc, field)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Document status, defaulting to draft.
pub fn docstatus(doc: &Document) -> i64 {
    doc.get("docstatus").and_then(Value::as_i64).unwrap_or(DOCSTATUS_DRAFT)
}

/// Child rows of a document (e.g. `accounts`, `items`).
pub fn doc_rows<'a>(doc: &'a Document, field: &str) -> Vec<&'a Document> {
    match doc.get(field) {
        Some(Value::Array(rows)) => rows.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

/// Store a decimal the way the target keeps money: as a string.
pub fn decimal_value(amount: Decimal) -> Value {
    Value::String(amount.normalize().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(record_type: &str) -> ExternalRecord {
        ExternalRecord {
            record_type: record_type.to_string(),
            external_id: "M-1".to_string(),
            posting_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            amount: Decimal::new(12100, 2),
            party_reference: Some("C-001".to_string()),
            reference_no: None,
            description: None,
            lines: Vec::new(),
            invoice_reference: None,
            created_at: None,
        }
    }

    #[test]
    fn test_classify_normalizes_tags() {
        for tag in ["sales_invoice", "SalesInvoice", "sales-invoice", "FactuurVerstuurd"] {
            assert_eq!(
                Mutation::classify(record(tag)).entity_type(),
                Some(EntityType::SalesInvoice),
                "{}",
                tag
            );
        }
    }

    #[test]
    fn test_classify_directions() {
        match Mutation::classify(record("FactuurOntvangen")) {
            Mutation::Invoice { direction, .. } => assert_eq!(direction, Direction::Outgoing),
            other => panic!("unexpected {:?}", other),
        }
        match Mutation::classify(record("GeldOntvangen")) {
            Mutation::Payment { direction, .. } => assert_eq!(direction, Direction::Incoming),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            Mutation::classify(record("Memoriaal")).entity_type(),
            Some(EntityType::JournalEntry)
        );
    }

    #[test]
    fn test_classify_unknown_keeps_record() {
        let mutation = Mutation::classify(record("opening_balance"));
        assert_eq!(mutation.entity_type(), None);
        assert_eq!(mutation.record().external_id, "M-1");
    }

    #[test]
    fn test_doc_decimal_accepts_numbers_and_strings() {
        let doc = json!({"a": 12.5, "b": "99.50", "c": "n/a", "d": 1e3})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(doc_decimal(&doc, "a"), Some(Decimal::new(125, 1)));
        assert_eq!(doc_decimal(&doc, "b"), Some(Decimal::new(9950, 2)));
        assert_eq!(doc_decimal(&doc, "c"), None);
        assert_eq!(doc_decimal(&doc, "d"), Some(Decimal::new(1000, 0)));
        assert_eq!(doc_decimal(&doc, "missing"), None);
    }

    #[test]
    fn test_doc_str_ignores_blank() {
        let doc = json!({"name": "  ", "title": "x"}).as_object().cloned().unwrap();
        assert_eq!(doc_str(&doc, "name"), None);
        assert_eq!(doc_str(&doc, "title"), Some("x"));
    }

    #[test]
    fn test_entity_type_round_trip_str() {
        for entity in EntityType::TRANSACTIONS {
            assert_eq!(entity.as_str().parse::<EntityType>().unwrap(), entity);
        }
        assert!("invoice".parse::<EntityType>().is_err());
    }
}
