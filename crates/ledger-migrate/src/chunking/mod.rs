//! Date-range chunking under the source API's per-call record limit.
//!
//! The source returns at most `api_limit` records per call and silently
//! truncates larger results, so a fetch that comes back full may be missing
//! records. [`DateRangeChunker`] sizes windows so every call stays below the
//! limit, shrinking and re-fetching a window whenever it does not.

use crate::config::ChunkingConfig;
use crate::core::ExternalRecord;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Days in the sampling window used by [`DateRangeChunker::estimate_optimal_strategy`].
const SAMPLE_DAYS: i64 = 7;

/// A date window fetched in a single API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub estimated_records: usize,
    /// Records actually returned, once fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_records: Option<usize>,
}

impl Chunk {
    pub fn new(from: NaiveDate, to: NaiveDate, estimated_records: usize) -> Self {
        Self {
            from,
            to,
            estimated_records,
            actual_records: None,
        }
    }

    /// Inclusive length in days.
    pub fn days(&self) -> i64 {
        inclusive_days(self.from, self.to)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// Fetches and processes chunks for [`DateRangeChunker::adaptive_chunk_processing`].
#[async_trait]
pub trait ChunkWorker: Send + Sync {
    type Output: Send;

    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<ExternalRecord>>;

    async fn process(&self, chunk: &Chunk, records: Vec<ExternalRecord>) -> Result<Self::Output>;
}

/// Outcome of one chunk.
#[derive(Debug)]
pub struct ChunkResult<T> {
    pub chunk: Chunk,
    /// Shrink-and-retry rounds spent on this range.
    pub shrink_retries: u32,
    pub output: Option<T>,
    pub error: Option<String>,
}

impl<T> ChunkResult<T> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Results of an adaptive pass, in date order.
#[derive(Debug)]
pub struct ChunkingReport<T> {
    pub results: Vec<ChunkResult<T>>,
    pub api_calls: usize,
    pub total_records: usize,
}

impl<T> ChunkingReport<T> {
    pub fn failed_chunks(&self) -> impl Iterator<Item = &ChunkResult<T>> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// Recommended fetch granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    SingleRequest,
    Monthly,
    Weekly,
    Daily,
}

impl FetchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::SingleRequest => "single_request",
            FetchStrategy::Monthly => "monthly",
            FetchStrategy::Weekly => "weekly",
            FetchStrategy::Daily => "daily",
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateConfidence {
    High,
    Medium,
    Low,
}

/// Result of sampling the source before a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEstimate {
    pub strategy: FetchStrategy,
    pub confidence: EstimateConfidence,
    pub sample_days: i64,
    pub sample_records: usize,
    /// The sample itself hit the API limit; the rate is a lower bound.
    pub sample_truncated: bool,
    pub records_per_day: f64,
    pub estimated_total: f64,
    pub total_days: i64,
    pub estimated_chunks: usize,
    pub average_chunk_days: f64,
}

/// Splits date ranges into fetch-sized windows.
#[derive(Debug, Clone)]
pub struct DateRangeChunker {
    api_limit: usize,
    config: ChunkingConfig,
}

impl DateRangeChunker {
    pub fn new(api_limit: usize, config: ChunkingConfig) -> Self {
        Self {
            api_limit: api_limit.max(1),
            config,
        }
    }

    pub fn api_limit(&self) -> usize {
        self.api_limit
    }

    /// Records per call a chunk aims for: `api_limit * safety_margin`.
    pub fn effective_limit(&self) -> f64 {
        self.api_limit as f64 * self.config.safety_margin
    }

    fn clamp_days(&self, days: i64) -> i64 {
        days.clamp(self.config.min_days.max(1), self.config.max_days.max(1))
    }

    /// Split `[from, to]` into `ceil(days * rate / effective_limit) + 1`
    /// chunks of near-equal length. The count never exceeds the number of
    /// days in the range.
    pub fn calculate_optimal_chunks(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        records_per_day: f64,
    ) -> Vec<Chunk> {
        if to < from {
            return Vec::new();
        }
        let total_days = inclusive_days(from, to);
        let rate = records_per_day.max(0.0);
        let wanted = total_days as f64 * rate / self.effective_limit();
        // An unusable limit or unbounded rate means one chunk per day
        let count = if wanted.is_finite() {
            (wanted.ceil() + 1.0).clamp(1.0, total_days as f64) as i64
        } else {
            total_days
        };

        let base = total_days / count;
        let remainder = total_days % count;
        let mut chunks = Vec::with_capacity(count as usize);
        let mut start = from;
        for i in 0..count {
            let span = base + i64::from(i < remainder);
            let end = start + Duration::days(span - 1);
            let estimate = (span as f64 * rate).round() as usize;
            chunks.push(Chunk::new(start, end, estimate));
            start = end + Duration::days(1);
        }

        debug!(
            "{} days at {:.1} records/day -> {} chunks",
            total_days,
            rate,
            chunks.len()
        );
        chunks
    }

    /// Walk `[from, to]` with adaptively sized chunks.
    ///
    /// A fetch returning `api_limit` or more records is treated as truncated:
    /// the window is halved and the same start date fetched again. Once the
    /// window is at the minimum size, or the range has been shrunk
    /// `max_shrink_retries` times, the chunk is recorded as failed with
    /// [`MigrateError::ApiLimitExceeded`] and the pass moves on. After a good
    /// fetch the size moves halfway toward `effective_limit / observed rate`.
    ///
    /// Per-chunk errors are collected; only fatal errors abort the pass.
    pub async fn adaptive_chunk_processing<W>(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        worker: &W,
    ) -> Result<ChunkingReport<W::Output>>
    where
        W: ChunkWorker + ?Sized,
    {
        let mut report = ChunkingReport {
            results: Vec::new(),
            api_calls: 0,
            total_records: 0,
        };
        let mut size = self.clamp_days(self.config.initial_days);
        let mut current = from;
        let mut shrinks = 0u32;

        while current <= to {
            let end = std::cmp::min(current + Duration::days(size - 1), to);
            let mut chunk = Chunk::new(current, end, 0);
            report.api_calls += 1;

            let records = match worker.fetch(current, end).await {
                Ok(records) => records,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Chunk {} fetch failed: {}", chunk, e);
                    report.results.push(ChunkResult {
                        chunk,
                        shrink_retries: shrinks,
                        output: None,
                        error: Some(e.to_string()),
                    });
                    current = end + Duration::days(1);
                    shrinks = 0;
                    continue;
                }
            };

            let returned = records.len();
            if returned >= self.api_limit {
                let days = chunk.days();
                if days <= self.config.min_days.max(1) || shrinks >= self.config.max_shrink_retries {
                    let e = MigrateError::ApiLimitExceeded {
                        returned,
                        limit: self.api_limit,
                    };
                    warn!("Chunk {} cannot be split further: {}", chunk, e);
                    chunk.actual_records = Some(returned);
                    report.results.push(ChunkResult {
                        chunk,
                        shrink_retries: shrinks,
                        output: None,
                        error: Some(e.to_string()),
                    });
                    current = end + Duration::days(1);
                    shrinks = 0;
                    continue;
                }
                size = self.clamp_days(days / 2);
                shrinks += 1;
                info!(
                    "Chunk {} returned {} records (limit {}), retrying with {} day(s)",
                    chunk, returned, self.api_limit, size
                );
                continue;
            }

            chunk.actual_records = Some(returned);
            report.total_records += returned;
            let retries = shrinks;
            shrinks = 0;
            size = self.retune(size, returned, chunk.days());

            let result = match worker.process(&chunk, records).await {
                Ok(output) => ChunkResult {
                    chunk,
                    shrink_retries: retries,
                    output: Some(output),
                    error: None,
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Chunk {} processing failed: {}", chunk, e);
                    ChunkResult {
                        chunk,
                        shrink_retries: retries,
                        output: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            current = result.chunk.to + Duration::days(1);
            report.results.push(result);
        }

        info!(
            "Chunked pass complete: {} chunks, {} records, {} API calls, {} failed",
            report.results.len(),
            report.total_records,
            report.api_calls,
            report.failed_chunks().count()
        );
        Ok(report)
    }

    fn retune(&self, size: i64, returned: usize, days: i64) -> i64 {
        let observed = returned as f64 / days.max(1) as f64;
        let ideal = if observed > 0.0 {
            self.effective_limit() / observed
        } else {
            self.config.max_days as f64
        };
        let next = ((size as f64 + ideal) / 2.0).round() as i64;
        self.clamp_days(next)
    }

    /// Sample the first days of the range and recommend a fetch strategy.
    ///
    /// Below the effective limit in total, one request suffices. Otherwise
    /// under 10 records/day is monthly, up to 50 weekly and above that daily.
    pub async fn estimate_optimal_strategy<W>(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        worker: &W,
    ) -> Result<StrategyEstimate>
    where
        W: ChunkWorker + ?Sized,
    {
        if to < from {
            return Err(MigrateError::Config(format!(
                "date range is empty: {} > {}",
                from, to
            )));
        }
        let total_days = inclusive_days(from, to);
        let sample_days = total_days.min(SAMPLE_DAYS);
        let sample_to = from + Duration::days(sample_days - 1);
        let sample = worker.fetch(from, sample_to).await?;

        let sample_records = sample.len();
        let sample_truncated = sample_records >= self.api_limit;
        let records_per_day = sample_records as f64 / sample_days as f64;
        let estimated_total = records_per_day * total_days as f64;

        let strategy = if !sample_truncated && estimated_total < self.effective_limit() {
            FetchStrategy::SingleRequest
        } else if records_per_day < 10.0 {
            FetchStrategy::Monthly
        } else if records_per_day <= 50.0 {
            FetchStrategy::Weekly
        } else {
            FetchStrategy::Daily
        };

        let confidence = if sample_truncated {
            EstimateConfidence::Low
        } else if sample_records >= 100 {
            EstimateConfidence::High
        } else if sample_records >= 20 {
            EstimateConfidence::Medium
        } else {
            EstimateConfidence::Low
        };

        let chunks = match strategy {
            FetchStrategy::SingleRequest => vec![Chunk::new(from, to, estimated_total.round() as usize)],
            _ => self.calculate_optimal_chunks(from, to, records_per_day),
        };
        let estimate = StrategyEstimate {
            strategy,
            confidence,
            sample_days,
            sample_records,
            sample_truncated,
            records_per_day,
            estimated_total,
            total_days,
            estimated_chunks: chunks.len(),
            average_chunk_days: total_days as f64 / chunks.len() as f64,
        };
        info!(
            "Estimated {:.0} records over {} days ({:.1}/day): {} in {} chunks ({:?} confidence)",
            estimate.estimated_total,
            total_days,
            records_per_day,
            strategy,
            estimate.estimated_chunks,
            confidence
        );
        Ok(estimate)
    }
}

/// Days in `[from, to]`, counting both ends.
pub fn inclusive_days(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days() + 1
}
