//! Paginated range fetching behind the [`HistoricalSource`] trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use candela_types::{Candle, Timeframe, TimeRange};
use tracing::debug;

use crate::client::{FetchError, RestClient, PAGE_LIMIT};

/// A provider of closed historical candles.
///
/// The reconciliation engine is written against this trait so tests can
/// drive it with a scripted source instead of the live exchange.
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    /// Fetches all closed candles in the half-open range, oldest first,
    /// de-duplicated by timestamp.
    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, FetchError>;
}

#[async_trait]
impl HistoricalSource for RestClient {
    /// Pages backward from the end of the range.
    ///
    /// The endpoint returns rows strictly older than the `after` cursor,
    /// newest first, so each page advances the cursor to its oldest row.
    /// Overlapping or duplicate rows collapse in the timestamp map.
    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
    ) -> Result<Vec<Candle>, FetchError> {
        let mut by_ts: BTreeMap<i64, Candle> = BTreeMap::new();
        let mut cursor = range.end_ms;
        let mut pages = 0u32;

        loop {
            let page = self.history_page(symbol, timeframe, cursor, PAGE_LIMIT).await?;
            pages += 1;
            let Some(oldest) = page.iter().map(|c| c.ts).min() else {
                break;
            };
            for candle in page {
                if range.contains(candle.ts) {
                    by_ts.insert(candle.ts, candle);
                }
            }
            // The cursor must strictly decrease or pagination cannot make
            // progress.
            if oldest <= range.start_ms || oldest >= cursor {
                break;
            }
            cursor = oldest;
        }

        debug!(
            %symbol,
            %timeframe,
            pages,
            candles = by_ts.len(),
            "range fetch complete"
        );
        Ok(by_ts.into_values().collect())
    }
}
