//! In-memory candle store for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use candela_types::{Candle, CandleKey, Timeframe, TimeRange};
use chrono::Utc;
use tokio::sync::Mutex;

use crate::resolve::{resolve, RejectReason, Resolution};
use crate::store::{CandleStore, RejectedCandle, StoreError, UpsertOutcome};

/// A permanently failed item recorded via
/// [`record_permanent_failure`](CandleStore::record_permanent_failure).
#[derive(Debug, Clone)]
pub struct FailureRecord {
    /// The candle that could not be written.
    pub candle: Candle,
    /// Last error message.
    pub error: String,
    /// Delivery attempts made.
    pub attempts: u32,
}

/// [`CandleStore`] backed by a `BTreeMap`, applying the same conflict
/// rules as [`PgStore`](crate::PgStore) through [`resolve`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    candles: Mutex<BTreeMap<CandleKey, Candle>>,
    failures: Mutex<Vec<FailureRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored candles.
    pub async fn len(&self) -> usize {
        self.candles.lock().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.candles.lock().await.is_empty()
    }

    /// Returns the stored candle for `key`, if any.
    pub async fn get(&self, key: &CandleKey) -> Option<Candle> {
        self.candles.lock().await.get(key).cloned()
    }

    /// Recorded permanent failures, oldest first.
    pub async fn failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().await.clone()
    }

    /// Inserts a candle bypassing validation and conflict rules.
    ///
    /// Only for seeding corrective-path scenarios (pre-validation rows that
    /// a real table could contain) in tests and dry runs.
    pub async fn force_insert(&self, candle: Candle) {
        self.candles.lock().await.insert(candle.key(), candle);
    }

    fn range_bounds(symbol: &str, timeframe: Timeframe, range: TimeRange) -> (CandleKey, CandleKey) {
        let lo = CandleKey {
            symbol: symbol.to_string(),
            timeframe,
            ts: range.start_ms,
        };
        let hi = CandleKey {
            symbol: symbol.to_string(),
            timeframe,
            ts: range.end_ms,
        };
        (lo, hi)
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<UpsertOutcome, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut outcome = UpsertOutcome::default();
        let mut map = self.candles.lock().await;
        for candle in candles {
            let key = candle.key();
            match resolve(map.get(&key), candle, now_ms) {
                Resolution::Apply => {
                    if map.insert(key, candle.clone()).is_some() {
                        outcome.updated += 1;
                    } else {
                        outcome.inserted += 1;
                    }
                }
                Resolution::Skip => outcome.skipped += 1,
                Resolution::Reject(reason) => {
                    outcome.rejected.push(RejectedCandle { key, reason });
                }
            }
        }
        Ok(outcome)
    }

    async fn candles_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, StoreError> {
        let (lo, hi) = Self::range_bounds(symbol, timeframe, range);
        let map = self.candles.lock().await;
        Ok(map.range(lo..hi).map(|(_, c)| c.clone()).collect())
    }

    async fn existing_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<BTreeSet<i64>, StoreError> {
        let (lo, hi) = Self::range_bounds(symbol, timeframe, range);
        let map = self.candles.lock().await;
        Ok(map.range(lo..hi).map(|(k, _)| k.ts).collect())
    }

    async fn invalid_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<BTreeSet<i64>, StoreError> {
        // Upsert validates on the way in, so only candles force-loaded by
        // tests can be invalid here.
        let now_ms = Utc::now().timestamp_millis();
        let (lo, hi) = Self::range_bounds(symbol, timeframe, range);
        let map = self.candles.lock().await;
        Ok(map
            .range(lo..hi)
            .filter(|(_, c)| c.validate(now_ms).is_err())
            .map(|(k, _)| k.ts)
            .collect())
    }

    async fn delete_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        timestamps: &[i64],
    ) -> Result<u64, StoreError> {
        let mut map = self.candles.lock().await;
        let mut removed = 0;
        for &ts in timestamps {
            let key = CandleKey {
                symbol: symbol.to_string(),
                timeframe,
                ts,
            };
            if map.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn collapse_duplicates(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _range: TimeRange,
    ) -> Result<u64, StoreError> {
        // Keyed by CandleKey, so duplicates cannot exist here.
        Ok(0)
    }

    async fn active_symbols(&self, since_ms: i64) -> Result<Vec<String>, StoreError> {
        let map = self.candles.lock().await;
        let mut symbols: Vec<String> = map
            .keys()
            .filter(|k| k.ts >= since_ms)
            .map(|k| k.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    async fn record_permanent_failure(
        &self,
        candle: &Candle,
        error: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.failures.lock().await.push(FailureRecord {
            candle: candle.clone(),
            error: error.to_string(),
            attempts,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candela_types::CandleSource;
    use rust_decimal_macros::dec;

    fn candle(ts: i64, close: rust_decimal::Decimal, confirmed: bool) -> Candle {
        Candle {
            symbol: "BTC-USDT-SWAP".to_string(),
            timeframe: Timeframe::Minute5,
            ts,
            open: dec!(42000),
            high: dec!(42100),
            low: dec!(41950),
            close,
            volume: dec!(10),
            quote_volume: dec!(420000),
            confirmed,
            received_at: Utc::now(),
            source: CandleSource::Stream,
        }
    }

    fn aligned_now() -> i64 {
        Timeframe::Minute5.align(Utc::now().timestamp_millis())
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let c = candle(aligned_now(), dec!(42050), true);
        let first = store.upsert_candles(&[c.clone()]).await.unwrap();
        assert_eq!(first.inserted, 1);
        let second = store.upsert_candles(&[c]).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 1);
        assert!(second.is_clean());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_last_write_wins_while_unconfirmed() {
        let store = MemoryStore::new();
        let ts = aligned_now();
        // 100 revisions of the same open bucket.
        for i in 1..=100i64 {
            let c = candle(ts, dec!(42000) + rust_decimal::Decimal::from(i), false);
            let outcome = store.upsert_candles(&[c]).await.unwrap();
            assert_eq!(outcome.applied(), 1);
        }
        assert_eq!(store.len().await, 1);
        let stored = store
            .get(&CandleKey {
                symbol: "BTC-USDT-SWAP".to_string(),
                timeframe: Timeframe::Minute5,
                ts,
            })
            .await
            .unwrap();
        assert_eq!(stored.close, dec!(42100));
    }

    #[tokio::test]
    async fn test_confirmed_row_is_immutable() {
        let store = MemoryStore::new();
        let ts = aligned_now();
        store
            .upsert_candles(&[candle(ts, dec!(42050), true)])
            .await
            .unwrap();
        let outcome = store
            .upsert_candles(&[candle(ts, dec!(42080), false)])
            .await
            .unwrap();
        assert_eq!(outcome.applied(), 0);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].reason, RejectReason::ConfirmedImmutable);
        let stored = store
            .get(&CandleKey {
                symbol: "BTC-USDT-SWAP".to_string(),
                timeframe: Timeframe::Minute5,
                ts,
            })
            .await
            .unwrap();
        assert_eq!(stored.close, dec!(42050));
    }

    #[tokio::test]
    async fn test_invalid_candle_rejected_not_stored() {
        let store = MemoryStore::new();
        let mut c = candle(aligned_now(), dec!(42050), false);
        c.low = dec!(-5);
        let outcome = store.upsert_candles(&[c]).await.unwrap();
        assert_eq!(outcome.applied(), 0);
        assert!(matches!(
            outcome.rejected[0].reason,
            RejectReason::Invalid(_)
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_range_queries_are_half_open() {
        let store = MemoryStore::new();
        let step = Timeframe::Minute5.duration_ms();
        let base = aligned_now() - 10 * step;
        let candles: Vec<Candle> = (0..4).map(|i| candle(base + i * step, dec!(42000), true)).collect();
        store.upsert_candles(&candles).await.unwrap();

        let range = TimeRange::new(base, base + 3 * step).unwrap();
        let got = store
            .candles_in_range("BTC-USDT-SWAP", Timeframe::Minute5, range)
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        let ts: BTreeSet<i64> = store
            .existing_timestamps("BTC-USDT-SWAP", Timeframe::Minute5, range)
            .await
            .unwrap();
        assert_eq!(ts.len(), 3);
        assert!(!ts.contains(&(base + 3 * step)));
    }

    #[tokio::test]
    async fn test_delete_and_active_symbols() {
        let store = MemoryStore::new();
        let step = Timeframe::Minute5.duration_ms();
        let base = aligned_now() - 10 * step;
        store
            .upsert_candles(&[candle(base, dec!(42000), true), candle(base + step, dec!(42000), true)])
            .await
            .unwrap();

        assert_eq!(
            store.active_symbols(base).await.unwrap(),
            vec!["BTC-USDT-SWAP".to_string()]
        );
        assert!(store.active_symbols(base + 2 * step).await.unwrap().is_empty());

        let removed = store
            .delete_candles("BTC-USDT-SWAP", Timeframe::Minute5, &[base, base + step])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.is_empty().await);
    }
}
