//! Source API backed by an exported JSON file.

use crate::core::{ApiResponse, ExternalRecord, SourceApi};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordFile {
    List(Vec<ExternalRecord>),
    Wrapped { records: Vec<ExternalRecord> },
}

/// Serves records from memory with the same per-call cap as the live API.
///
/// Results are ordered by posting date and truncated to `limit`, so a range
/// holding more records than the cap looks exactly like an over-full API page.
pub struct FileSource {
    endpoint: String,
    limit: usize,
    records: Vec<ExternalRecord>,
    calls: AtomicU64,
}

impl FileSource {
    /// Load a JSON array of records, or an object with a `records` array.
    pub fn load<P: AsRef<Path>>(path: P, endpoint: impl Into<String>, limit: usize) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Source(format!("cannot read {}: {}", path.display(), e))
        })?;
        let records = match serde_json::from_str(&content)? {
            RecordFile::List(records) | RecordFile::Wrapped { records } => records,
        };
        info!("Loaded {} source records from {}", records.len(), path.display());
        Ok(Self::from_records(endpoint, records, limit))
    }

    pub fn from_records(
        endpoint: impl Into<String>,
        mut records: Vec<ExternalRecord>,
        limit: usize,
    ) -> Self {
        records.sort_by(|a, b| {
            a.posting_date
                .cmp(&b.posting_date)
                .then_with(|| a.external_id.cmp(&b.external_id))
        });
        Self {
            endpoint: endpoint.into(),
            limit: limit.max(1),
            records,
            calls: AtomicU64::new(0),
        }
    }

    /// Records available, regardless of the per-call cap.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of `fetch` calls served.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SourceApi for FileSource {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn record_limit(&self) -> usize {
        self.limit
    }

    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<ApiResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let records: Vec<ExternalRecord> = self
            .records
            .iter()
            .filter(|r| r.posting_date >= from && r.posting_date <= to)
            .take(self.limit)
            .cloned()
            .collect();

        let mut response = ApiResponse::ok(records);
        response
            .headers
            .insert("X-RateLimit-Limit".to_string(), self.limit.to_string());
        Ok(response)
    }
}
