//! Pipeline counters and the periodic gauge reporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::queue::{DeadLetterItem, QueueItem, QueueSender};

/// Shared monotonic counters for the live pipeline.
///
/// Cheap enough to bump from every worker; a reporter task publishes them
/// periodically together with the queue depth gauges.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Candles received off the stream.
    pub received: AtomicU64,
    /// Rows written by the batch processor (inserted + updated).
    pub processed: AtomicU64,
    /// Confirmed-row no-ops.
    pub skipped: AtomicU64,
    /// Candles rejected at the store boundary.
    pub rejected: AtomicU64,
    /// Items dropped because the work queue was full.
    pub dropped: AtomicU64,
    /// Items parked on the dead-letter queue.
    pub dead_lettered: AtomicU64,
    /// Items past the retry ceiling, written to the failure log.
    pub permanent_failures: AtomicU64,
}

impl PipelineMetrics {
    /// Creates a zeroed counter set behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Candles received off the stream.
    pub received: u64,
    /// Rows written by the batch processor.
    pub processed: u64,
    /// Confirmed-row no-ops.
    pub skipped: u64,
    /// Candles rejected at the store boundary.
    pub rejected: u64,
    /// Items dropped on a full work queue.
    pub dropped: u64,
    /// Items parked on the dead-letter queue.
    pub dead_lettered: u64,
    /// Items written to the permanent failure log.
    pub permanent_failures: u64,
}

/// Publishes pipeline gauges at a fixed interval until shutdown.
pub async fn report_loop(
    metrics: Arc<PipelineMetrics>,
    work: QueueSender<QueueItem>,
    dlq: QueueSender<DeadLetterItem>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = metrics.snapshot();
                info!(
                    queue_depth = work.depth(),
                    dlq_depth = dlq.depth(),
                    received = snap.received,
                    processed = snap.processed,
                    skipped = snap.skipped,
                    rejected = snap.rejected,
                    dropped = snap.dropped,
                    dead_lettered = snap.dead_lettered,
                    permanent_failures = snap.permanent_failures,
                    "pipeline metrics"
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = PipelineMetrics::default();
        PipelineMetrics::add(&metrics.received, 5);
        PipelineMetrics::add(&metrics.processed, 3);
        PipelineMetrics::add(&metrics.dropped, 1);
        let snap = metrics.snapshot();
        assert_eq!(snap.received, 5);
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.dead_lettered, 0);
    }
}
