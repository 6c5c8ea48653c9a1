//! Field filters for target queries.

use super::record::{value_decimal, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A single field condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Field equals value.
    Eq(String, Value),
    /// Field lies within the inclusive range.
    Between(String, Value, Value),
}

/// Conjunction of conditions. An empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.into(), value.into()));
        self
    }

    pub fn between(
        mut self,
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.conditions
            .push(Condition::Between(field.into(), low.into(), high.into()));
        self
    }

    /// Whether the document satisfies every condition.
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(field, expected) => doc
                .get(field)
                .map(|actual| values_equal(actual, expected))
                .unwrap_or(false),
            Condition::Between(field, low, high) => match doc.get(field) {
                Some(actual) => {
                    matches!(
                        compare(actual, low),
                        Some(Ordering::Greater | Ordering::Equal)
                    ) && matches!(
                        compare(actual, high),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                }
                None => false,
            },
        })
    }
}

/// Equality with numeric coercion between JSON numbers and numeric strings.
fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (value_decimal(a), value_decimal(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Number(_), Value::Number(_)) => value_decimal(a) == value_decimal(b),
        _ => false,
    }
}

/// Ordering for range checks: numeric when both sides parse as decimals,
/// lexical for other strings (ISO dates and RFC 3339 timestamps sort correctly).
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (value_decimal(a), value_decimal(b)) {
        return Some(x.cmp(&y));
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(Filter::new().matches(&doc(json!({}))));
    }

    #[test]
    fn test_eq_with_numeric_coercion() {
        let d = doc(json!({"grand_total": "121.00", "customer": "C-1"}));
        assert!(Filter::new().eq("grand_total", 121).matches(&d));
        assert!(Filter::new().eq("customer", "C-1").matches(&d));
        assert!(!Filter::new().eq("customer", "C-2").matches(&d));
        assert!(!Filter::new().eq("missing", "x").matches(&d));
    }

    #[test]
    fn test_identifier_strings_are_not_coerced() {
        let d = doc(json!({"reference_no": "00123"}));
        assert!(!Filter::new().eq("reference_no", "123").matches(&d));
    }

    #[test]
    fn test_between_dates_and_amounts() {
        let d = doc(json!({"posting_date": "2024-02-10", "paid_amount": "100"}));
        assert!(Filter::new()
            .between("posting_date", "2024-02-03", "2024-02-17")
            .between("paid_amount", "95", "105")
            .matches(&d));
        assert!(!Filter::new()
            .between("posting_date", "2024-02-11", "2024-02-17")
            .matches(&d));
    }
}
