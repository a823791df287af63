//! Dead-letter consumer: delayed re-enqueue with a retry ceiling.

use std::sync::Arc;
use std::time::Duration;

use candela_store::CandleStore;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::PipelineMetrics;
use crate::queue::{DeadLetterItem, QueueItem, QueueReceiver, QueueSender};

/// Retry policy for dead-lettered items.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Attempts allowed before an item is written off.
    pub max_retries: u32,
    /// Per-attempt delay unit; attempt `k` waits `k * retry_delay`.
    pub retry_delay: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(10),
        }
    }
}

/// Feeds dead-lettered items back into the work queue, or into the
/// permanent failure log once the retry ceiling is hit.
#[derive(Debug)]
pub struct DlqConsumer<S> {
    store: Arc<S>,
    rx: QueueReceiver<DeadLetterItem>,
    work: QueueSender<QueueItem>,
    metrics: Arc<PipelineMetrics>,
    config: DlqConfig,
}

impl<S: CandleStore> DlqConsumer<S> {
    /// Creates a consumer over the given queue ends.
    pub fn new(
        store: Arc<S>,
        rx: QueueReceiver<DeadLetterItem>,
        work: QueueSender<QueueItem>,
        metrics: Arc<PipelineMetrics>,
        config: DlqConfig,
    ) -> Self {
        Self {
            store,
            rx,
            work,
            metrics,
            config,
        }
    }

    /// Runs until shutdown or the dead-letter queue closes.
    ///
    /// Items are handled one at a time; the linear backoff is a pause of
    /// the whole consumer, which also throttles a store that is still
    /// recovering.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let item = tokio::select! {
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
            self.handle(item, &mut shutdown).await;
        }
        debug!("dead-letter consumer stopped");
    }

    async fn handle(&self, dead: DeadLetterItem, shutdown: &mut watch::Receiver<bool>) {
        let key = dead.item.candle.key();
        if dead.item.attempts >= self.config.max_retries {
            warn!(
                %key,
                attempts = dead.item.attempts,
                error = %dead.error,
                "retry ceiling reached, recording permanent failure"
            );
            PipelineMetrics::add(&self.metrics.permanent_failures, 1);
            if let Err(err) = self
                .store
                .record_permanent_failure(&dead.item.candle, &dead.error, dead.item.attempts)
                .await
            {
                error!(%key, %err, "failed to record permanent failure");
            }
            return;
        }

        let delay = self.config.retry_delay * dead.item.attempts;
        info!(%key, attempt = dead.item.attempts, ?delay, "re-enqueueing dead-lettered item");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        if self.work.send(dead.item).await.is_err() {
            error!(%key, "work queue closed, dropping dead-lettered item");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{bounded, QueueItem};
    use crate::test_support::sample_candle;
    use candela_store::MemoryStore;

    fn consumer_parts(
        config: DlqConfig,
    ) -> (
        Arc<MemoryStore>,
        QueueSender<DeadLetterItem>,
        QueueReceiver<QueueItem>,
        DlqConsumer<MemoryStore>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let (dlq_tx, dlq_rx) = bounded(16);
        let (work_tx, work_rx) = bounded(16);
        let consumer = DlqConsumer::new(
            Arc::clone(&store),
            dlq_rx,
            work_tx,
            PipelineMetrics::shared(),
            config,
        );
        (store, dlq_tx, work_rx, consumer)
    }

    #[tokio::test]
    async fn test_below_ceiling_re_enqueues_after_delay() {
        let config = DlqConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
        };
        let (_store, dlq_tx, mut work_rx, consumer) = consumer_parts(config);
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(consumer.run(stop_rx));

        let item = QueueItem {
            candle: sample_candle(0),
            enqueued_at: chrono::Utc::now(),
            attempts: 0,
        };
        dlq_tx
            .try_send(DeadLetterItem::new(item, "db down".to_string()))
            .unwrap();

        let requeued = work_rx.recv().await.unwrap();
        assert_eq!(requeued.attempts, 1);
    }

    #[tokio::test]
    async fn test_at_ceiling_records_permanent_failure() {
        let config = DlqConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
        };
        let (store, dlq_tx, mut work_rx, consumer) = consumer_parts(config);
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(consumer.run(stop_rx));

        let item = QueueItem {
            candle: sample_candle(0),
            enqueued_at: chrono::Utc::now(),
            attempts: 2,
        };
        // DeadLetterItem::new bumps attempts to the ceiling.
        dlq_tx
            .try_send(DeadLetterItem::new(item, "db down".to_string()))
            .unwrap();

        for _ in 0..100 {
            if !store.failures().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let failures = store.failures().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 3);
        assert_eq!(failures[0].error, "db down");

        // Nothing was re-enqueued.
        assert!(work_rx.try_recv().is_none());
    }
}
