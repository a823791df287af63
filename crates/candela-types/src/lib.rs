//! Core types for the candela OHLCV ingestion pipeline.
//!
//! This crate provides the fundamental data structures used throughout candela:
//!
//! - [`Candle`] - One OHLCV observation keyed by (symbol, timeframe, timestamp)
//! - [`Timeframe`] - Candle bucket duration with boundary alignment helpers
//! - [`TimeRange`] - Millisecond time range with expected-timestamp iteration
//! - [`CandelaError`] - Shared error taxonomy for the pipeline

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod candle;
mod error;
mod range;
mod timeframe;

pub use candle::{Candle, CandleKey, CandleSource, SYSTEM_EPOCH_MS};
pub use error::{CandelaError, Result, ValidationError};
pub use range::{TimeRange, TimestampIterator};
pub use timeframe::{Timeframe, TimeframeParseError};
