//! Live-ingestion pipeline stages for candela.
//!
//! Candles received off the stream flow through a bounded work queue into
//! the batch processor, and through a dead-letter queue when persistence
//! fails:
//!
//! - [`bounded`] / [`QueueSender`] / [`QueueReceiver`] - Depth-gauged queues
//! - [`BatchProcessor`] - Size/time batching into transactional upserts
//! - [`DlqConsumer`] - Delayed re-enqueue with a retry ceiling
//! - [`PipelineMetrics`] - Shared counters and the periodic reporter

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod batch;
mod dead_letter;
mod metrics;
mod queue;
#[cfg(test)]
mod test_support;

pub use batch::{BatchConfig, BatchProcessor};
pub use dead_letter::{DlqConfig, DlqConsumer};
pub use metrics::{report_loop, MetricsSnapshot, PipelineMetrics};
pub use queue::{bounded, DeadLetterItem, QueueError, QueueItem, QueueReceiver, QueueSender};
