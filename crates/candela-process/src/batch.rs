//! Size/time batching of queued candles into transactional upserts.

use std::sync::Arc;
use std::time::Duration;

use candela_store::CandleStore;
use candela_types::Candle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::metrics::PipelineMetrics;
use crate::queue::{DeadLetterItem, QueueItem, QueueReceiver, QueueSender};

/// Batching thresholds.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush when this many items have accumulated.
    pub batch_size: usize,
    /// Flush when this much time has passed since the first item.
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
        }
    }
}

/// Drains the work queue into the store, one transactional batch at a time.
///
/// A batch that fails to persist is parked on the dead-letter queue in its
/// entirety; nothing is retried inline on the hot path.
#[derive(Debug)]
pub struct BatchProcessor<S> {
    store: Arc<S>,
    rx: QueueReceiver<QueueItem>,
    dlq: QueueSender<DeadLetterItem>,
    metrics: Arc<PipelineMetrics>,
    config: BatchConfig,
}

impl<S: CandleStore> BatchProcessor<S> {
    /// Creates a processor over the given queue ends.
    pub fn new(
        store: Arc<S>,
        rx: QueueReceiver<QueueItem>,
        dlq: QueueSender<DeadLetterItem>,
        metrics: Arc<PipelineMetrics>,
        config: BatchConfig,
    ) -> Self {
        Self {
            store,
            rx,
            dlq,
            metrics,
            config,
        }
    }

    /// Runs until shutdown or the work queue closes, then drains what is
    /// left so a graceful stop loses nothing already queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let first = tokio::select! {
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let mut batch = vec![first];
            let deadline = Instant::now() + self.config.batch_timeout;
            while batch.len() < self.config.batch_size {
                tokio::select! {
                    item = self.rx.recv() => match item {
                        Some(item) => batch.push(item),
                        None => break,
                    },
                    () = tokio::time::sleep_until(deadline) => break,
                }
            }
            self.flush(batch).await;
        }

        // Drain whatever was queued before the stop signal.
        let mut rest = Vec::new();
        while let Some(item) = self.rx.try_recv() {
            rest.push(item);
            if rest.len() == self.config.batch_size {
                self.flush(std::mem::take(&mut rest)).await;
            }
        }
        if !rest.is_empty() {
            self.flush(rest).await;
        }
        debug!("batch processor stopped");
    }

    async fn flush(&self, batch: Vec<QueueItem>) {
        let candles: Vec<Candle> = batch.iter().map(|item| item.candle.clone()).collect();
        match self.store.upsert_candles(&candles).await {
            Ok(outcome) => {
                PipelineMetrics::add(&self.metrics.processed, outcome.applied());
                PipelineMetrics::add(&self.metrics.skipped, outcome.skipped);
                PipelineMetrics::add(&self.metrics.rejected, outcome.rejected.len() as u64);
                for rejected in &outcome.rejected {
                    warn!(key = %rejected.key, reason = %rejected.reason, "candle rejected");
                }
                debug!(
                    batch = batch.len(),
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    skipped = outcome.skipped,
                    "batch flushed"
                );
            }
            Err(err) => {
                warn!(%err, batch = batch.len(), "batch upsert failed, parking on dead-letter queue");
                PipelineMetrics::add(&self.metrics.dead_lettered, batch.len() as u64);
                let message = err.to_string();
                for item in batch {
                    let dead = DeadLetterItem::new(item, message.clone());
                    if self.dlq.send(dead).await.is_err() {
                        error!("dead-letter queue closed, dropping failed items");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::bounded;
    use crate::test_support::{sample_candle, FlakyStore};
    use candela_store::MemoryStore;
    use candela_types::Timeframe;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_flushes_when_batch_fills() {
        let store = Arc::new(MemoryStore::new());
        let (work_tx, work_rx) = bounded(64);
        let (dlq_tx, _dlq_rx) = bounded(64);
        let metrics = PipelineMetrics::shared();
        let config = BatchConfig {
            batch_size: 3,
            batch_timeout: Duration::from_secs(60),
        };
        let processor = BatchProcessor::new(
            Arc::clone(&store),
            work_rx,
            dlq_tx,
            Arc::clone(&metrics),
            config,
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(processor.run(stop_rx));

        for i in 0..3 {
            work_tx.try_send(QueueItem::new(sample_candle(i))).unwrap();
        }
        wait_until(|| {
            let store = Arc::clone(&store);
            async move { store.len().await == 3 }
        })
        .await;
        assert_eq!(metrics.snapshot().processed, 3);
    }

    #[tokio::test]
    async fn test_flushes_on_timeout_with_partial_batch() {
        let store = Arc::new(MemoryStore::new());
        let (work_tx, work_rx) = bounded(64);
        let (dlq_tx, _dlq_rx) = bounded(64);
        let metrics = PipelineMetrics::shared();
        let config = BatchConfig {
            batch_size: 100,
            batch_timeout: Duration::from_millis(50),
        };
        let processor = BatchProcessor::new(
            Arc::clone(&store),
            work_rx,
            dlq_tx,
            metrics,
            config,
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(processor.run(stop_rx));

        work_tx.try_send(QueueItem::new(sample_candle(0))).unwrap();
        wait_until(|| {
            let store = Arc::clone(&store);
            async move { store.len().await == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_hundred_revisions_collapse_to_one_row() {
        let store = Arc::new(MemoryStore::new());
        let (work_tx, work_rx) = bounded(256);
        let (dlq_tx, _dlq_rx) = bounded(64);
        let metrics = PipelineMetrics::shared();
        let config = BatchConfig {
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
        };
        let processor = BatchProcessor::new(
            Arc::clone(&store),
            work_rx,
            dlq_tx,
            metrics,
            config,
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(processor.run(stop_rx));

        let base = sample_candle(0);
        let mut last_close = Decimal::ZERO;
        for i in 1..=100i64 {
            let mut candle = base.clone();
            candle.close = dec!(42000) + Decimal::from(i);
            candle.high = candle.high.max(candle.close);
            last_close = candle.close;
            work_tx.try_send(QueueItem::new(candle)).unwrap();
        }
        wait_until(|| {
            let store = Arc::clone(&store);
            async move { store.len().await == 1 }
        })
        .await;
        let stored = store.get(&base.key()).await.unwrap();
        assert_eq!(stored.close, last_close);
        assert_eq!(stored.timeframe, Timeframe::Minute5);
    }

    #[tokio::test]
    async fn test_failed_batch_parks_on_dlq() {
        let store = Arc::new(FlakyStore::failing(u32::MAX));
        let (work_tx, work_rx) = bounded(64);
        let (dlq_tx, mut dlq_rx) = bounded(64);
        let metrics = PipelineMetrics::shared();
        let config = BatchConfig {
            batch_size: 2,
            batch_timeout: Duration::from_secs(60),
        };
        let processor = BatchProcessor::new(
            store,
            work_rx,
            dlq_tx,
            Arc::clone(&metrics),
            config,
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(processor.run(stop_rx));

        work_tx.try_send(QueueItem::new(sample_candle(0))).unwrap();
        work_tx.try_send(QueueItem::new(sample_candle(1))).unwrap();

        let first = dlq_rx.recv().await.unwrap();
        let second = dlq_rx.recv().await.unwrap();
        assert_eq!(first.item.attempts, 1);
        assert_eq!(second.item.attempts, 1);
        assert!(first.error.contains("injected"));
        assert_eq!(metrics.snapshot().dead_lettered, 2);
    }
}
