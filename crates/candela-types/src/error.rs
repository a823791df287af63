//! Error types shared across the candela pipeline.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::Timeframe;

/// Result type alias for candela operations.
pub type Result<T> = std::result::Result<T, CandelaError>;

/// Errors that can occur across the ingestion and reconciliation pipeline.
#[derive(Error, Debug)]
pub enum CandelaError {
    /// Connection-level transport fault (retried, never fatal).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload that could not be parsed into a candle.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Error response from the exchange API.
    #[error("Exchange API error {code}: {message}")]
    Api {
        /// Exchange-reported error code.
        code: String,
        /// Exchange-reported error message.
        message: String,
    },

    /// Request rejected by an upstream rate limit.
    #[error("Rate limited (retry after {retry_after_ms}ms)")]
    RateLimited {
        /// Suggested delay before retrying.
        retry_after_ms: u64,
    },

    /// Candle store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// A record violating the candle invariants.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Invalid time range.
    #[error("Invalid time range: start {start_ms} >= end {end_ms}")]
    InvalidRange {
        /// Requested start, epoch milliseconds.
        start_ms: i64,
        /// Requested end, epoch milliseconds.
        end_ms: i64,
    },

    /// Invalid timeframe string.
    #[error(transparent)]
    Timeframe(#[from] crate::TimeframeParseError),

    /// Configuration error (fatal at startup).
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A violated candle invariant.
///
/// Rejected at the store boundary and reported in run summaries, never
/// silently coerced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Low price is zero or negative.
    #[error("non-positive price: low = {low}")]
    NonPositivePrice {
        /// The offending low price.
        low: Decimal,
    },

    /// Volume is negative.
    #[error("negative volume: {volume}")]
    NegativeVolume {
        /// The offending volume.
        volume: Decimal,
    },

    /// OHLC ordering broken: requires low <= min(open, close) <= max(open, close) <= high.
    #[error("OHLC ordering violated: o={open} h={high} l={low} c={close}")]
    OhlcOrdering {
        /// Open price.
        open: Decimal,
        /// High price.
        high: Decimal,
        /// Low price.
        low: Decimal,
        /// Close price.
        close: Decimal,
    },

    /// Timestamp does not sit on the timeframe boundary.
    #[error("timestamp {ts} not aligned to {timeframe} boundary")]
    Misaligned {
        /// The offending timestamp.
        ts: i64,
        /// The expected grid.
        timeframe: Timeframe,
    },

    /// Timestamp before the system epoch or too far in the future.
    #[error("timestamp {ts} outside sane bounds (max {upper})")]
    TimestampOutOfBounds {
        /// The offending timestamp.
        ts: i64,
        /// Maximum accepted timestamp at validation time.
        upper: i64,
    },
}
