//! Batched processing with a bounded worker pool.
//!
//! Records are split into sequential batches. Inside a batch each record
//! runs on its own task, bounded by a semaphore, and reports its outcome
//! over a channel to a single aggregator. Nothing else is shared between
//! workers.

mod progress;

pub use progress::{ProgressEvent, ProgressSink, ProgressTracker};

use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failures kept verbatim in the batch statistics.
const MAX_RECORDED_FAILURES: usize = 100;

/// Result of processing one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RecordOutcome {
    Succeeded,
    Skipped(String),
    Failed(String),
}

/// Counts of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_number: usize,
    pub size: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// A failed record, by position in the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub index: usize,
    pub error: String,
}

/// Totals over all batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub batches: usize,
    pub duration_secs: f64,
    pub skip_reasons: BTreeMap<String, usize>,
    pub failures: Vec<RecordFailure>,
}

impl BatchStats {
    fn absorb(&mut self, batch: &BatchResult) {
        self.batches += 1;
        self.processed += batch.size;
        self.succeeded += batch.succeeded;
        self.skipped += batch.skipped;
        self.failed += batch.failed;
    }

    pub fn merge(&mut self, other: BatchStats) {
        self.total += other.total;
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.batches += other.batches;
        self.duration_secs += other.duration_secs;
        for (reason, n) in other.skip_reasons {
            *self.skip_reasons.entry(reason).or_insert(0) += n;
        }
        for failure in other.failures {
            if self.failures.len() >= MAX_RECORDED_FAILURES {
                break;
            }
            self.failures.push(failure);
        }
    }
}

/// Work applied to each record, with batch lifecycle hooks.
#[async_trait]
pub trait BatchHandler<T>: Send + Sync + 'static {
    /// Called before the records of a batch are dispatched.
    async fn begin_batch(&self, _batch_number: usize) -> Result<()> {
        Ok(())
    }

    /// Process one record. Per-record problems are outcomes, not errors.
    async fn process(&self, item: T) -> RecordOutcome;

    /// Called after every record of the batch has reported.
    async fn commit_batch(&self, _batch: &BatchResult) -> Result<()> {
        Ok(())
    }

    /// Drop per-run caches; called every `cache_clear_interval` batches.
    fn clear_caches(&self) {}
}

/// Splits work into batches and runs each batch on a bounded pool.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    batch_size: usize,
    workers: usize,
    cache_clear_interval: usize,
    progress_interval: Duration,
    progress: ProgressSink,
    cancel: CancellationToken,
}

impl BatchProcessor {
    pub fn new(batch_size: usize, workers: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            workers: workers.max(1),
            cache_clear_interval: 10,
            progress_interval: Duration::from_secs(5),
            progress: ProgressSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink, interval: Duration) -> Self {
        self.progress = sink;
        self.progress_interval = interval;
        self
    }

    pub fn with_cache_clear_interval(mut self, batches: usize) -> Self {
        self.cache_clear_interval = batches.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn process_in_batches<T, H>(&self, records: Vec<T>, handler: Arc<H>) -> Result<BatchStats>
    where
        T: Send + 'static,
        H: BatchHandler<T>,
    {
        let started = Instant::now();
        let total = records.len();
        let mut stats = BatchStats {
            total,
            ..Default::default()
        };
        let mut tracker = ProgressTracker::new(self.progress.clone(), total, self.progress_interval);
        let semaphore = Arc::new(Semaphore::new(self.workers));

        let mut remaining = records.into_iter().enumerate().peekable();
        let mut batch_number = 0;
        while remaining.peek().is_some() {
            if self.cancel.is_cancelled() {
                warn!("Cancelled after {} of {} records", stats.processed, total);
                return Err(MigrateError::Cancelled);
            }
            batch_number += 1;
            let batch: Vec<(usize, T)> = remaining.by_ref().take(self.batch_size).collect();

            handler.begin_batch(batch_number).await?;
            let result = self
                .run_batch(batch_number, batch, &handler, &semaphore, &mut stats)
                .await?;
            handler.commit_batch(&result).await?;

            stats.absorb(&result);
            debug!(
                "Batch {}: {} ok, {} skipped, {} failed",
                batch_number, result.succeeded, result.skipped, result.failed
            );
            if batch_number % self.cache_clear_interval == 0 {
                handler.clear_caches();
            }
            tracker.update(stats.processed);
        }

        stats.duration_secs = started.elapsed().as_secs_f64();
        tracker.complete(stats.processed);
        info!(
            "Processed {} records in {} batches: {} succeeded, {} skipped, {} failed",
            stats.processed, stats.batches, stats.succeeded, stats.skipped, stats.failed
        );
        Ok(stats)
    }

    async fn run_batch<T, H>(
        &self,
        batch_number: usize,
        batch: Vec<(usize, T)>,
        handler: &Arc<H>,
        semaphore: &Arc<Semaphore>,
        stats: &mut BatchStats,
    ) -> Result<BatchResult>
    where
        T: Send + 'static,
        H: BatchHandler<T>,
    {
        let size = batch.len();
        let (tx, mut rx) = mpsc::channel::<(usize, RecordOutcome)>(size.max(1));
        let mut handles = Vec::with_capacity(size);

        for (index, item) in batch {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| MigrateError::critical("batch", e.to_string()))?;
            let handler = handler.clone();
            let tx = tx.clone();
            handles.push((
                index,
                tokio::spawn(async move {
                    let outcome = handler.process(item).await;
                    drop(permit);
                    let _ = tx.send((index, outcome)).await;
                }),
            ));
        }
        drop(tx);

        let mut result = BatchResult {
            batch_number,
            size,
            ..Default::default()
        };
        let mut reported = vec![false; size];
        let first_index = handles.first().map_or(0, |(i, _)| *i);
        while let Some((index, outcome)) = rx.recv().await {
            reported[index - first_index] = true;
            tally(&mut result, stats, index, outcome);
        }

        // A worker that panicked never reported
        for (index, handle) in handles {
            if let Err(e) = handle.await {
                if !reported[index - first_index] {
                    tally(
                        &mut result,
                        stats,
                        index,
                        RecordOutcome::Failed(format!("worker failed: {}", e)),
                    );
                }
            }
        }
        Ok(result)
    }
}

fn tally(result: &mut BatchResult, stats: &mut BatchStats, index: usize, outcome: RecordOutcome) {
    match outcome {
        RecordOutcome::Succeeded => result.succeeded += 1,
        RecordOutcome::Skipped(reason) => {
            result.skipped += 1;
            *stats.skip_reasons.entry(reason).or_insert(0) += 1;
        }
        RecordOutcome::Failed(error) => {
            result.failed += 1;
            if stats.failures.len() < MAX_RECORDED_FAILURES {
                stats.failures.push(RecordFailure { index, error });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        commits: Mutex<Vec<BatchResult>>,
        clears: AtomicUsize,
    }

    #[async_trait]
    impl BatchHandler<u32> for Recorder {
        async fn process(&self, item: u32) -> RecordOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match item % 5 {
                0 => RecordOutcome::Skipped("duplicate".into()),
                1 if item > 20 => panic!("boom"),
                3 => RecordOutcome::Failed(format!("bad record {}", item)),
                _ => RecordOutcome::Succeeded,
            }
        }

        async fn commit_batch(&self, batch: &BatchResult) -> Result<()> {
            self.commits.lock().unwrap().push(batch.clone());
            Ok(())
        }

        fn clear_caches(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_and_worker_bound() {
        let handler = Arc::new(Recorder::default());
        let processor = BatchProcessor::new(4, 2).with_cache_clear_interval(2);
        let stats = processor
            .process_in_batches((1..=10).collect(), handler.clone())
            .await
            .unwrap();

        assert_eq!(stats.total, 10);
        assert_eq!(stats.processed, 10);
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.succeeded, 6);
        assert_eq!(stats.skip_reasons["duplicate"], 2);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);

        let commits = handler.commits.lock().unwrap();
        let sizes: Vec<usize> = commits.iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(handler.clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_worker_counts_as_failure() {
        let handler = Arc::new(Recorder::default());
        let stats = BatchProcessor::new(10, 4)
            .process_in_batches(vec![21, 22], handler)
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failures[0].index, 0);
        assert!(stats.failures[0].error.starts_with("worker failed"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = BatchProcessor::new(2, 2)
            .with_cancellation(cancel)
            .process_in_batches(vec![1u32, 2], Arc::new(Recorder::default()))
            .await;
        assert!(matches!(result, Err(MigrateError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_completion_event() {
        let (tx, mut rx) = mpsc::channel(8);
        BatchProcessor::new(5, 1)
            .with_progress(ProgressSink::new(tx), Duration::from_secs(5))
            .process_in_batches(vec![2u32, 4], Arc::new(Recorder::default()))
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Complete {
                total: 2,
                processed: 2,
                ..
            })
        ));
    }
}
