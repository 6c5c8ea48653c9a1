//! Core traits at the boundaries of the migration engine.
//!
//! - [`SourceApi`]: fetches records from the rate-limited accounting API
//! - [`TargetSystem`]: the destination store records are written into
//!
//! Both are object safe so the orchestrator can hold them as `Arc<dyn _>`.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;

use crate::error::Result;

use super::filter::Filter;
use super::record::{Document, EntityType, ExternalRecord};

/// Raw response of one source API call.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// Response headers (rate-limit signals such as `Retry-After`).
    pub headers: HashMap<String, String>,
    /// Records returned; empty for error responses.
    pub records: Vec<ExternalRecord>,
}

impl ApiResponse {
    /// A 200 response carrying the given records.
    pub fn ok(records: Vec<ExternalRecord>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            records,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// Case-insensitive lookup in a header map.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Read records from the source accounting API.
///
/// Implementations return the raw response; status interpretation and
/// throttling happen in [`crate::source::ResilientSource`].
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Endpoint label, used to key resilience state.
    fn endpoint(&self) -> &str;

    /// Maximum records a single call returns.
    fn record_limit(&self) -> usize;

    /// Fetch records posted within `[from, to]` (inclusive).
    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<ApiResponse>;
}

/// Destination store for imported records.
///
/// Documents are JSON objects. The target assigns the `name` identifier on
/// create unless the document already carries one (used when recreating a
/// deleted record during rollback).
#[async_trait]
pub trait TargetSystem: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Create a record, returning its identifier.
    ///
    /// Rejected documents fail with [`crate::MigrateError::Validation`].
    async fn create(&self, entity: EntityType, data: Document) -> Result<String>;

    /// Merge `changes` into an existing record.
    async fn update(&self, entity: EntityType, id: &str, changes: Document) -> Result<()>;

    /// Delete a draft or cancelled record.
    async fn delete(&self, entity: EntityType, id: &str) -> Result<()>;

    /// Finalize a draft record.
    async fn submit(&self, entity: EntityType, id: &str) -> Result<()>;

    /// Cancel a submitted record so it can be deleted.
    async fn cancel(&self, entity: EntityType, id: &str) -> Result<()>;

    /// Fetch a record by identifier.
    async fn get(&self, entity: EntityType, id: &str) -> Result<Option<Document>>;

    /// All records matching the filter.
    async fn query(&self, entity: EntityType, filter: &Filter) -> Result<Vec<Document>>;

    /// Whether any record matches the filter.
    async fn exists(&self, entity: EntityType, filter: &Filter) -> Result<bool> {
        Ok(!self.query(entity, filter).await?.is_empty())
    }
}
