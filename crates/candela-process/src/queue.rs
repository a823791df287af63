//! Bounded in-process queues with depth gauges.
//!
//! The collector pushes into the work queue with a non-blocking
//! [`try_send`](QueueSender::try_send); a full queue drops the item rather
//! than stalling the socket read loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candela_types::{Candle, CandleSource};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

/// A candle waiting to be persisted.
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// The candle payload.
    pub candle: Candle,
    /// When the item entered the pipeline.
    pub enqueued_at: DateTime<Utc>,
    /// Persistence attempts made so far.
    pub attempts: u32,
}

impl QueueItem {
    /// Wraps a freshly received candle.
    #[must_use]
    pub fn new(candle: Candle) -> Self {
        Self {
            candle,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Where the candle entered the pipeline.
    #[must_use]
    pub const fn origin(&self) -> CandleSource {
        self.candle.source
    }
}

/// A batch member that failed to persist, parked for retry.
#[derive(Debug, Clone)]
pub struct DeadLetterItem {
    /// The original work item, attempts already incremented.
    pub item: QueueItem,
    /// The persistence error that sent it here.
    pub error: String,
    /// When the failure happened.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterItem {
    /// Parks a failed item with its error.
    #[must_use]
    pub fn new(mut item: QueueItem, error: String) -> Self {
        item.attempts += 1;
        Self {
            item,
            error,
            failed_at: Utc::now(),
        }
    }
}

/// Why an enqueue failed, carrying the item back to the caller.
#[derive(Debug, Error)]
pub enum QueueError<T> {
    /// The queue is at capacity.
    #[error("queue is full")]
    Full(T),
    /// All receivers are gone.
    #[error("queue is closed")]
    Closed(T),
}

/// Sending half of a bounded queue.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueues without blocking; a full queue refuses the item.
    ///
    /// # Errors
    ///
    /// Returns the item back inside the error on a full or closed queue.
    pub fn try_send(&self, item: T) -> Result<(), QueueError<T>> {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(item)) => Err(QueueError::Full(item)),
            Err(mpsc::error::TrySendError::Closed(item)) => Err(QueueError::Closed(item)),
        }
    }

    /// Enqueues, waiting for capacity. Used off the hot path (re-enqueues).
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue is closed.
    pub async fn send(&self, item: T) -> Result<(), QueueError<T>> {
        match self.tx.send(item).await {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(item)) => Err(QueueError::Closed(item)),
        }
    }

    /// Current queue depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Receiving half of a bounded queue.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> QueueReceiver<T> {
    /// Receives the next item, or `None` once all senders are gone and the
    /// queue has drained.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Receives without waiting; used to drain the queue at shutdown.
    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.rx.try_recv().ok();
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Current queue depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Creates a bounded queue with a shared depth gauge.
#[must_use]
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            depth: Arc::clone(&depth),
        },
        QueueReceiver { rx, depth },
    )
}
