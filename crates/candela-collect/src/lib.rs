//! Live candle collection for candela.
//!
//! One worker task per subscribed symbol keeps a WebSocket session to the
//! exchange's push feed and forwards candles into the work queue:
//!
//! - [`Supervisor`] - Subscribe/unsubscribe lifecycle across workers
//! - [`StreamWorker`] - One symbol's connect/subscribe/stream/backoff loop
//! - [`Backoff`] - Exponential reconnect delays with a stability reset
//! - [`StatusAggregator`] - Collects worker snapshots over mpsc

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backoff;
mod message;
mod state;
mod supervisor;
mod worker;

pub use backoff::{Backoff, BackoffConfig};
pub use message::{parse_frame, subscribe_request, unsubscribe_request, Frame, FrameError};
pub use state::{ConnectionState, ConnectionStatus, StatusAggregator};
pub use supervisor::Supervisor;
pub use worker::{StreamWorker, WorkerConfig};
