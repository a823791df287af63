//! The storage trait and its result types.

use std::collections::BTreeSet;

use async_trait::async_trait;
use candela_types::{Candle, CandleKey, Timeframe, TimeRange};
use thiserror::Error;

use crate::RejectReason;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database driver failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failed to serialize a rejected payload for the failure log.
    #[error("Failed to encode failure payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Store unreachable at startup (fatal configuration error).
    #[error("Failed to connect to candle store: {0}")]
    Connect(String),
}

/// A candle that was not written, with the reason.
#[derive(Debug, Clone)]
pub struct RejectedCandle {
    /// Key of the rejected candle.
    pub key: CandleKey,
    /// Why the write was refused.
    pub reason: RejectReason,
}

/// Result of one batch upsert.
#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    /// Rows newly inserted.
    pub inserted: u64,
    /// Existing unconfirmed rows overwritten.
    pub updated: u64,
    /// Confirmed rows re-sent with identical values (no-ops).
    pub skipped: u64,
    /// Candles refused, with reasons.
    pub rejected: Vec<RejectedCandle>,
}

impl UpsertOutcome {
    /// Total rows actually written.
    #[must_use]
    pub const fn applied(&self) -> u64 {
        self.inserted + self.updated
    }

    /// Returns true if nothing was rejected.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    /// Folds another outcome into this one.
    pub fn merge(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.rejected.extend(other.rejected);
    }
}

/// The single mutation entry point shared by every candle writer.
///
/// Both the live batch processor and the reconciliation engine write
/// through [`upsert_candles`](Self::upsert_candles); there is no second,
/// divergent write path.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Idempotently writes a batch of candles.
    ///
    /// Invalid candles and writes against differing confirmed rows are
    /// rejected and reported in the outcome, never silently dropped.
    /// The batch is transactional: a storage fault leaves no partial batch.
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<UpsertOutcome, StoreError>;

    /// Returns candles in the range, ordered by timestamp ascending.
    async fn candles_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, StoreError>;

    /// Returns the set of stored timestamps in the range.
    async fn existing_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<BTreeSet<i64>, StoreError>;

    /// Returns timestamps of stored rows violating the OHLC/positivity
    /// invariants (data written before validation was enforced).
    async fn invalid_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<BTreeSet<i64>, StoreError>;

    /// Deletes the given timestamps so a corrective backfill can replace them.
    async fn delete_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        timestamps: &[i64],
    ) -> Result<u64, StoreError>;

    /// Corrective pass for data written before the uniqueness discipline:
    /// per key keeps the confirmed row if any, else the most recently
    /// received, and deletes the rest. Returns rows removed.
    async fn collapse_duplicates(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<u64, StoreError>;

    /// Symbols with any stored candle at or after `since_ms`.
    async fn active_symbols(&self, since_ms: i64) -> Result<Vec<String>, StoreError>;

    /// Records an item that exhausted its dead-letter retries, for
    /// operator inspection.
    async fn record_permanent_failure(
        &self,
        candle: &Candle,
        error: &str,
        attempts: u32,
    ) -> Result<(), StoreError>;
}
