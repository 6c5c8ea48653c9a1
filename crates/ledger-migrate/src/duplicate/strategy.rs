//! Individual duplicate matching strategies.
//!
//! Each strategy queries the target for candidates and returns the matches
//! it accepts. Strategies never mutate the target.

use super::DuplicateMatch;
use crate::config::{DuplicateConfig, MatchStrategy};
use crate::core::{doc_date, doc_decimal, doc_str, doc_timestamp, Document, EntityType, Filter, TargetSystem};
use crate::error::Result;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use strsim::normalized_levenshtein;

pub const EXTERNAL_ID_CONFIDENCE: u8 = 100;
pub const REFERENCE_CONFIDENCE: u8 = 90;
pub const UNIQUE_KEY_CONFIDENCE: u8 = 95;
pub const COMPOSITE_CONFIDENCE: u8 = 85;
pub const TEMPORAL_CONFIDENCE: u8 = 75;

fn matched(doc: &Document, strategy: MatchStrategy, confidence: u8, detail: String) -> Option<DuplicateMatch> {
    doc_str(doc, "name").map(|id| DuplicateMatch {
        matched_id: id.to_string(),
        strategy,
        confidence,
        detail,
    })
}

/// Fields that identify a record uniquely within its entity type when no
/// identifier is available.
pub fn unique_key_fields(entity: EntityType) -> Vec<&'static str> {
    match (entity.date_field(), entity.amount_field()) {
        (Some(date), Some(amount)) => vec![date, amount, "description"],
        _ => vec![entity.title_field()],
    }
}

/// Stable identifiers, tried in order of strength: external id (100),
/// reference number (90), unique key (95). Only the strongest identifier
/// present on the candidate is used.
pub async fn exact(
    target: &dyn TargetSystem,
    entity: EntityType,
    record: &Document,
) -> Result<Vec<DuplicateMatch>> {
    let (filter, confidence, detail) = if let Some(id) = doc_str(record, "external_id") {
        (
            Filter::new().eq("external_id", id),
            EXTERNAL_ID_CONFIDENCE,
            format!("external_id = {}", id),
        )
    } else if let Some(reference) = doc_str(record, "reference_no") {
        (
            Filter::new().eq("reference_no", reference),
            REFERENCE_CONFIDENCE,
            format!("reference_no = {}", reference),
        )
    } else {
        let fields = unique_key_fields(entity);
        let mut filter = Filter::new();
        for field in &fields {
            match record.get(*field) {
                Some(value) if !value.is_null() => filter = filter.eq(*field, value.clone()),
                _ => return Ok(Vec::new()),
            }
        }
        (filter, UNIQUE_KEY_CONFIDENCE, format!("unique key ({})", fields.join(", ")))
    };

    Ok(target
        .query(entity, &filter)
        .await?
        .iter()
        .filter_map(|doc| matched(doc, MatchStrategy::Exact, confidence, detail.clone()))
        .collect())
}

/// Similarity of configured text fields among records of the same party
/// within a date and amount window.
pub async fn fuzzy(
    target: &dyn TargetSystem,
    entity: EntityType,
    record: &Document,
    config: &DuplicateConfig,
) -> Result<Vec<DuplicateMatch>> {
    let (Some(date_field), Some(amount_field)) = (entity.date_field(), entity.amount_field()) else {
        return Ok(Vec::new());
    };
    let (Some(date), Some(amount)) = (doc_date(record, date_field), doc_decimal(record, amount_field))
    else {
        return Ok(Vec::new());
    };

    let window = Duration::days(config.date_window_days);
    let mut filter = Filter::new().between(
        date_field,
        (date - window).to_string(),
        (date + window).to_string(),
    );
    if let Some((party_field, party)) = entity
        .party_field()
        .and_then(|field| doc_str(record, field).map(|party| (field, party)))
    {
        filter = filter.eq(party_field, party);
    }
    let tolerance = amount.abs() * decimal_pct(config.amount_tolerance_pct);

    let mut matches = Vec::new();
    for doc in target.query(entity, &filter).await? {
        let Some(other) = doc_decimal(&doc, amount_field) else {
            continue;
        };
        if (other - amount).abs() > tolerance {
            continue;
        }
        let Some(score) = field_similarity(record, &doc, &config.fuzzy_fields) else {
            continue;
        };
        if score >= config.fuzzy_threshold {
            let confidence = score.round().clamp(0.0, 100.0) as u8;
            if let Some(m) = matched(
                &doc,
                MatchStrategy::Fuzzy,
                confidence,
                format!("{:.0}% similar", score),
            ) {
                matches.push(m);
            }
        }
    }
    Ok(matches)
}

/// Average similarity (0-100) over the fields present on both documents.
pub fn field_similarity(a: &Document, b: &Document, fields: &[String]) -> Option<f64> {
    let scores: Vec<f64> = fields
        .iter()
        .filter_map(|field| {
            let left = doc_str(a, field)?;
            let right = doc_str(b, field)?;
            Some(normalized_levenshtein(&normalize(left), &normalize(right)) * 100.0)
        })
        .collect();
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn decimal_pct(pct: f64) -> Decimal {
    Decimal::from_f64_retain(pct / 100.0).unwrap_or(Decimal::ZERO)
}

/// Same party, posting date and amount. Requires all three on the candidate.
pub async fn composite_key(
    target: &dyn TargetSystem,
    entity: EntityType,
    record: &Document,
) -> Result<Vec<DuplicateMatch>> {
    let Some(filter) = party_date_filter(entity, record) else {
        return Ok(Vec::new());
    };
    let Some(amount) = entity.amount_field().and_then(|f| doc_decimal(record, f)) else {
        return Ok(Vec::new());
    };
    Ok(target
        .query(entity, &filter)
        .await?
        .iter()
        .filter(|doc| same_amount(entity, doc, amount))
        .filter_map(|doc| {
            matched(
                doc,
                MatchStrategy::CompositeKey,
                COMPOSITE_CONFIDENCE,
                "party + date + amount".to_string(),
            )
        })
        .collect())
}

/// Same party, date and amount created within the temporal window of the
/// candidate's creation time (now, when the candidate has none).
pub async fn temporal(
    target: &dyn TargetSystem,
    entity: EntityType,
    record: &Document,
    config: &DuplicateConfig,
) -> Result<Vec<DuplicateMatch>> {
    let Some(filter) = party_date_filter(entity, record) else {
        return Ok(Vec::new());
    };
    let Some(amount) = entity.amount_field().and_then(|f| doc_decimal(record, f)) else {
        return Ok(Vec::new());
    };
    let created = doc_timestamp(record, "creation").unwrap_or_else(Utc::now);
    let window = Duration::seconds(config.temporal_window_secs);

    Ok(target
        .query(entity, &filter)
        .await?
        .iter()
        .filter(|doc| same_amount(entity, doc, amount))
        .filter(|doc| {
            doc_timestamp(doc, "creation")
                .map(|other| (other - created).abs() <= window)
                .unwrap_or(false)
        })
        .filter_map(|doc| {
            matched(
                doc,
                MatchStrategy::Temporal,
                TEMPORAL_CONFIDENCE,
                format!("created within {}s", config.temporal_window_secs),
            )
        })
        .collect())
}

fn party_date_filter(entity: EntityType, record: &Document) -> Option<Filter> {
    let party_field = entity.party_field()?;
    let date_field = entity.date_field()?;
    let party = doc_str(record, party_field)?;
    let date = doc_str(record, date_field)?;
    Some(Filter::new().eq(party_field, party).eq(date_field, date))
}

fn same_amount(entity: EntityType, doc: &Document, amount: Decimal) -> bool {
    entity
        .amount_field()
        .and_then(|f| doc_decimal(doc, f))
        .is_some_and(|other| other == amount)
}
