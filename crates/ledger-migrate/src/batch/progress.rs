//! Fire-and-forget progress reporting.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Progress update published to the progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The orchestrator entered a phase.
    Phase { phase: String, percent: u8 },
    /// Record processing progress.
    Records {
        total: usize,
        processed: usize,
        percentage: f64,
        elapsed_secs: f64,
        /// Extrapolated from the observed rate; unknown until a record
        /// has been processed.
        eta_secs: Option<f64>,
    },
    /// All records were processed.
    Complete {
        total: usize,
        processed: usize,
        elapsed_secs: f64,
    },
}

/// Optional sender that never blocks: a full or closed channel drops the
/// event.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }

    pub fn phase(&self, phase: &str, percent: u8) {
        self.publish(ProgressEvent::Phase {
            phase: phase.to_string(),
            percent,
        });
    }
}

/// Publishes record progress at most once per interval.
#[derive(Debug)]
pub struct ProgressTracker {
    sink: ProgressSink,
    total: usize,
    interval: Duration,
    started: Instant,
    last_published: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(sink: ProgressSink, total: usize, interval: Duration) -> Self {
        Self {
            sink,
            total,
            interval,
            started: Instant::now(),
            last_published: None,
        }
    }

    /// Report `processed` records; publishes only when the interval has
    /// passed since the last update.
    pub fn update(&mut self, processed: usize) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_published {
            if now.duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_published = Some(now);
        self.sink.publish(self.snapshot(processed));
        true
    }

    pub fn complete(&self, processed: usize) {
        self.sink.publish(ProgressEvent::Complete {
            total: self.total,
            processed,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        });
    }

    pub fn snapshot(&self, processed: usize) -> ProgressEvent {
        let elapsed = self.started.elapsed().as_secs_f64();
        let percentage = if self.total == 0 {
            100.0
        } else {
            processed as f64 / self.total as f64 * 100.0
        };
        let eta_secs = (processed > 0 && elapsed > 0.0).then(|| {
            let rate = processed as f64 / elapsed;
            self.total.saturating_sub(processed) as f64 / rate
        });
        ProgressEvent::Records {
            total: self.total,
            processed,
            percentage,
            elapsed_secs: elapsed,
            eta_secs,
        }
    }
}
