//! Shared fixtures for the crate's tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use candela_store::{CandleStore, MemoryStore, StoreError, UpsertOutcome};
use candela_types::{Candle, CandleSource, Timeframe, TimeRange};
use chrono::Utc;
use rust_decimal_macros::dec;

/// A valid confirmed candle `i + 1` buckets in the past.
pub(crate) fn sample_candle(i: i64) -> Candle {
    let step = Timeframe::Minute5.duration_ms();
    let ts = Timeframe::Minute5.align(Utc::now().timestamp_millis()) - (i + 1) * step;
    Candle {
        symbol: "BTC-USDT-SWAP".to_string(),
        timeframe: Timeframe::Minute5,
        ts,
        open: dec!(42000),
        high: dec!(42100),
        low: dec!(41950),
        close: dec!(42050),
        volume: dec!(10),
        quote_volume: dec!(420000),
        confirmed: false,
        received_at: Utc::now(),
        source: CandleSource::Stream,
    }
}

/// Store wrapper whose first `n` upserts fail with a connection error.
#[derive(Debug)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    pub(crate) fn failing(n: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(n),
        }
    }

    #[allow(dead_code)]
    pub(crate) const fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl CandleStore for FlakyStore {
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<UpsertOutcome, StoreError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left.saturating_sub(1), Ordering::SeqCst);
            return Err(StoreError::Connect("injected failure".to_string()));
        }
        self.inner.upsert_candles(candles).await
    }

    async fn candles_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, StoreError> {
        self.inner.candles_in_range(symbol, timeframe, range).await
    }

    async fn existing_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<BTreeSet<i64>, StoreError> {
        self.inner.existing_timestamps(symbol, timeframe, range).await
    }

    async fn invalid_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<BTreeSet<i64>, StoreError> {
        self.inner.invalid_timestamps(symbol, timeframe, range).await
    }

    async fn delete_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        timestamps: &[i64],
    ) -> Result<u64, StoreError> {
        self.inner.delete_candles(symbol, timeframe, timestamps).await
    }

    async fn collapse_duplicates(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<u64, StoreError> {
        self.inner.collapse_duplicates(symbol, timeframe, range).await
    }

    async fn active_symbols(&self, since_ms: i64) -> Result<Vec<String>, StoreError> {
        self.inner.active_symbols(since_ms).await
    }

    async fn record_permanent_failure(
        &self,
        candle: &Candle,
        error: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.inner.record_permanent_failure(candle, error, attempts).await
    }
}
