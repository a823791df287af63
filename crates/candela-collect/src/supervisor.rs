//! Subscription management across per-symbol workers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use candela_process::{PipelineMetrics, QueueItem, QueueSender};
use candela_types::Timeframe;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::state::ConnectionStatus;
use crate::worker::{StreamWorker, WorkerConfig};

struct WorkerHandle {
    timeframes: BTreeSet<Timeframe>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    generation: u64,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("timeframes", &self.timeframes)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Spawns and tears down one [`StreamWorker`] task per subscribed symbol.
#[derive(Debug)]
pub struct Supervisor {
    config: WorkerConfig,
    queue: QueueSender<QueueItem>,
    metrics: Arc<PipelineMetrics>,
    status_tx: mpsc::Sender<ConnectionStatus>,
    workers: HashMap<String, WorkerHandle>,
    generation: u64,
}

impl Supervisor {
    /// Creates an empty supervisor.
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        queue: QueueSender<QueueItem>,
        metrics: Arc<PipelineMetrics>,
        status_tx: mpsc::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            config,
            queue,
            metrics,
            status_tx,
            workers: HashMap::new(),
            generation: 0,
        }
    }

    /// Subscribes a symbol to a set of timeframes.
    ///
    /// Idempotent: an identical existing subscription is a no-op; a
    /// different timeframe set tears the worker down and re-issues it.
    pub async fn subscribe(&mut self, symbol: &str, timeframes: BTreeSet<Timeframe>) {
        if timeframes.is_empty() {
            self.unsubscribe(symbol).await;
            return;
        }
        if let Some(handle) = self.workers.get(symbol) {
            if handle.timeframes == timeframes {
                debug!(symbol, "subscription unchanged");
                return;
            }
            info!(symbol, "timeframe set changed, restarting worker");
            self.unsubscribe(symbol).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = StreamWorker::new(
            symbol.to_string(),
            timeframes.clone(),
            self.config.clone(),
            self.queue.clone(),
            Arc::clone(&self.metrics),
            self.status_tx.clone(),
        );
        let task = tokio::spawn(worker.run(shutdown_rx));
        self.generation += 1;
        self.workers.insert(
            symbol.to_string(),
            WorkerHandle {
                timeframes,
                shutdown: shutdown_tx,
                task,
                generation: self.generation,
            },
        );
        info!(symbol, "subscribed");
    }

    /// Cancels a symbol's worker and waits for it to stop.
    ///
    /// Returns false if the symbol was not subscribed.
    pub async fn unsubscribe(&mut self, symbol: &str) -> bool {
        let Some(handle) = self.workers.remove(symbol) else {
            return false;
        };
        let _ = handle.shutdown.send(true);
        let _ = handle.task.await;
        info!(symbol, "unsubscribed");
        true
    }

    /// Currently subscribed symbols, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.workers.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Stops every worker.
    pub async fn shutdown(&mut self) {
        let symbols = self.symbols();
        for symbol in symbols {
            self.unsubscribe(&symbol).await;
        }
    }

    #[cfg(test)]
    fn generation_of(&self, symbol: &str) -> Option<u64> {
        self.workers.get(symbol).map(|h| h.generation)
    }
}
