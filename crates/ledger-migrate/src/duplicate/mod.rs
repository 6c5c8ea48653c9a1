//! Multi-strategy duplicate detection against the target system.

pub mod strategy;

use crate::config::{CombinePolicy, DuplicateConfig, MatchStrategy};
use crate::core::{doc_str, Document, EntityType, TargetSystem};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// One existing record a candidate appears to duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub matched_id: String,
    pub strategy: MatchStrategy,
    /// 0-100.
    pub confidence: u8,
    pub detail: String,
}

/// Result of checking one candidate record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCheck {
    pub candidate_key: String,
    /// True iff `matches` is non-empty.
    pub is_duplicate: bool,
    /// One match per target id, highest confidence first.
    pub matches: Vec<DuplicateMatch>,
    /// Combined confidence, 0-100.
    pub confidence: u8,
}

impl DuplicateCheck {
    pub fn best(&self) -> Option<&DuplicateMatch> {
        self.matches.first()
    }

    /// A stable identifier matched: the candidate is already in the target.
    pub fn is_confirmed(&self) -> bool {
        self.matches.iter().any(|m| m.strategy == MatchStrategy::Exact)
    }
}

/// Checks candidate documents against records already in the target.
pub struct DuplicateDetector {
    target: Arc<dyn TargetSystem>,
    config: DuplicateConfig,
}

impl DuplicateDetector {
    pub fn new(target: Arc<dyn TargetSystem>, config: DuplicateConfig) -> Self {
        Self { target, config }
    }

    pub fn config(&self) -> &DuplicateConfig {
        &self.config
    }

    /// Run the given strategies (the configured set when `None`) and merge
    /// their matches.
    pub async fn check_duplicate(
        &self,
        entity: EntityType,
        record: &Document,
        strategies: Option<&[MatchStrategy]>,
    ) -> Result<DuplicateCheck> {
        let strategies = strategies.unwrap_or(self.config.strategies.as_slice());
        let target = self.target.as_ref();

        let mut found = Vec::new();
        for kind in strategies {
            let matches = match kind {
                MatchStrategy::Exact => strategy::exact(target, entity, record).await?,
                MatchStrategy::Fuzzy => {
                    strategy::fuzzy(target, entity, record, &self.config).await?
                }
                MatchStrategy::CompositeKey => {
                    strategy::composite_key(target, entity, record).await?
                }
                MatchStrategy::Temporal => {
                    strategy::temporal(target, entity, record, &self.config).await?
                }
            };
            found.extend(matches);
        }

        let confidence = combine(&found, self.config.combine);
        let matches = merge(found);
        let check = DuplicateCheck {
            candidate_key: candidate_key(entity, record),
            is_duplicate: !matches.is_empty(),
            matches,
            confidence,
        };
        if check.is_duplicate {
            debug!(
                "{} {} matches {} record(s), confidence {}",
                entity,
                check.candidate_key,
                check.matches.len(),
                check.confidence
            );
        }
        Ok(check)
    }
}

/// Keep the highest-confidence match per target id, ordered by confidence
/// then id.
fn merge(found: Vec<DuplicateMatch>) -> Vec<DuplicateMatch> {
    let mut best: HashMap<String, DuplicateMatch> = HashMap::new();
    for m in found {
        match best.get(&m.matched_id) {
            Some(existing) if existing.confidence >= m.confidence => {}
            _ => {
                best.insert(m.matched_id.clone(), m);
            }
        }
    }
    let mut merged: Vec<DuplicateMatch> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.confidence
            .cmp(&a.confidence)
            .then_with(|| a.matched_id.cmp(&b.matched_id))
    });
    merged
}

/// Overall confidence of a set of matches.
pub fn combine(matches: &[DuplicateMatch], policy: CombinePolicy) -> u8 {
    match policy {
        CombinePolicy::Max => matches.iter().map(|m| m.confidence).max().unwrap_or(0),
        CombinePolicy::ProbabilisticOr => {
            let mut per_strategy: BTreeMap<MatchStrategy, u8> = BTreeMap::new();
            for m in matches {
                let entry = per_strategy.entry(m.strategy).or_insert(0);
                *entry = (*entry).max(m.confidence);
            }
            let miss: f64 = per_strategy
                .values()
                .map(|c| 1.0 - f64::from(*c) / 100.0)
                .product();
            ((1.0 - miss) * 100.0).round().clamp(0.0, 100.0) as u8
        }
    }
}

/// Key identifying a candidate in reports: its strongest identifier.
pub fn candidate_key(entity: EntityType, record: &Document) -> String {
    if let Some(id) = doc_str(record, "external_id") {
        return id.to_string();
    }
    if let Some(reference) = doc_str(record, "reference_no") {
        return reference.to_string();
    }
    let part = |field: Option<&str>| {
        field
            .and_then(|f| record.get(f))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default()
    };
    format!(
        "{}:{}:{}:{}",
        entity,
        part(entity.party_field()),
        part(entity.date_field()),
        part(entity.amount_field())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::InMemoryTarget;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn seeded() -> Arc<InMemoryTarget> {
        let target = Arc::new(InMemoryTarget::new());
        target
            .create(
                EntityType::SalesInvoice,
                doc(json!({
                    "external_id": "EXT-1",
                    "reference_no": "F2024-001",
                    "customer": "CUST-00001",
                    "posting_date": "2024-02-10",
                    "grand_total": "1000",
                    "description": "Membership fee February",
                })),
            )
            .await
            .unwrap();
        target
    }

    fn detector(target: Arc<InMemoryTarget>) -> DuplicateDetector {
        DuplicateDetector::new(target, DuplicateConfig::default())
    }

    #[tokio::test]
    async fn test_exact_external_id_is_full_confidence() {
        let d = detector(seeded().await);
        let candidate = doc(json!({"external_id": "EXT-1", "customer": "X"}));
        let check = d
            .check_duplicate(EntityType::SalesInvoice, &candidate, Some(&[MatchStrategy::Exact]))
            .await
            .unwrap();
        assert!(check.is_duplicate);
        assert_eq!(check.confidence, 100);
        assert_eq!(check.matches[0].matched_id, "SINV-00001");
        assert_eq!(check.candidate_key, "EXT-1");
    }

    #[tokio::test]
    async fn test_exact_reference_number() {
        let d = detector(seeded().await);
        let candidate = doc(json!({"reference_no": "F2024-001"}));
        let check = d
            .check_duplicate(EntityType::SalesInvoice, &candidate, Some(&[MatchStrategy::Exact]))
            .await
            .unwrap();
        assert_eq!(check.confidence, 90);
    }

    #[tokio::test]
    async fn test_exact_uses_strongest_identifier_only() {
        let d = detector(seeded().await);
        // New external id: the matching reference number is not consulted
        let candidate = doc(json!({"external_id": "EXT-2", "reference_no": "F2024-001"}));
        let check = d
            .check_duplicate(EntityType::SalesInvoice, &candidate, Some(&[MatchStrategy::Exact]))
            .await
            .unwrap();
        assert!(!check.is_duplicate);
        assert_eq!(check.confidence, 0);
    }

    #[tokio::test]
    async fn test_fuzzy_within_windows() {
        let d = detector(seeded().await);
        let candidate = doc(json!({
            "posting_date": "2024-02-14",
            "grand_total": "1020",
            "description": "Membership fee Februari",
            "customer": "CUST-00001",
        }));
        let check = d
            .check_duplicate(EntityType::SalesInvoice, &candidate, Some(&[MatchStrategy::Fuzzy]))
            .await
            .unwrap();
        assert!(check.is_duplicate);
        assert!(check.confidence >= 80 && check.confidence < 100);

        // Outside the amount window
        let far = doc(json!({
            "posting_date": "2024-02-14",
            "grand_total": "1100",
            "description": "Membership fee February",
        }));
        let check = d
            .check_duplicate(EntityType::SalesInvoice, &far, Some(&[MatchStrategy::Fuzzy]))
            .await
            .unwrap();
        assert!(!check.is_duplicate);
    }

    #[tokio::test]
    async fn test_composite_and_temporal() {
        let d = detector(seeded().await);
        let candidate = doc(json!({
            "customer": "CUST-00001",
            "posting_date": "2024-02-10",
            "grand_total": "1000.00",
        }));
        let check = d
            .check_duplicate(
                EntityType::SalesInvoice,
                &candidate,
                Some(&[MatchStrategy::CompositeKey, MatchStrategy::Temporal]),
            )
            .await
            .unwrap();
        // Both strategies hit the same record; one merged match remains
        assert_eq!(check.matches.len(), 1);
        assert_eq!(check.matches[0].strategy, MatchStrategy::CompositeKey);
        assert_eq!(check.confidence, 85);

        let later = doc(json!({
            "customer": "CUST-00001",
            "posting_date": "2024-02-10",
            "grand_total": "1000",
            "creation": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
        }));
        let check = d
            .check_duplicate(EntityType::SalesInvoice, &later, Some(&[MatchStrategy::Temporal]))
            .await
            .unwrap();
        assert!(!check.is_duplicate);
    }

    #[tokio::test]
    async fn test_detection_is_idempotent_and_bounded() {
        let d = detector(seeded().await);
        let candidate = doc(json!({
            "external_id": "EXT-1",
            "customer": "CUST-00001",
            "posting_date": "2024-02-10",
            "grand_total": "1000",
            "description": "Membership fee February",
        }));
        let first = d
            .check_duplicate(EntityType::SalesInvoice, &candidate, None)
            .await
            .unwrap();
        let second = d
            .check_duplicate(EntityType::SalesInvoice, &candidate, None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(first.confidence <= 100);
        assert_eq!(first.is_duplicate, !first.matches.is_empty());
    }

    #[test]
    fn test_combine_policies() {
        let m = |strategy, confidence| DuplicateMatch {
            matched_id: "A".into(),
            strategy,
            confidence,
            detail: String::new(),
        };
        let matches = vec![m(MatchStrategy::CompositeKey, 85), m(MatchStrategy::Temporal, 75)];
        assert_eq!(combine(&matches, CombinePolicy::Max), 85);
        // 1 - 0.15 * 0.25 = 0.9625
        assert_eq!(combine(&matches, CombinePolicy::ProbabilisticOr), 96);
        assert_eq!(combine(&[], CombinePolicy::ProbabilisticOr), 0);
    }
}
