//! OHLCV candle record and validation invariants.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Timeframe, ValidationError};

/// Earliest timestamp the pipeline accepts (2017-01-01T00:00:00Z).
///
/// The upstream exchange published no candles before this, so anything
/// earlier is a corrupt or misparsed timestamp.
pub const SYSTEM_EPOCH_MS: i64 = 1_483_228_800_000;

/// Where a candle entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleSource {
    /// Delivered live over the push feed.
    Stream,
    /// Retrieved from the historical request/response API.
    Backfill,
}

impl CandleSource {
    /// Returns the source as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Backfill => "backfill",
        }
    }
}

impl std::fmt::Display for CandleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Uniqueness key for a candle: (symbol, timeframe, timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandleKey {
    /// Instrument identifier (e.g. `BTC-USDT-SWAP`).
    pub symbol: String,
    /// Bucket duration.
    pub timeframe: Timeframe,
    /// Bucket open time, epoch milliseconds, aligned to the timeframe.
    pub ts: i64,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.symbol, self.timeframe, self.ts)
    }
}

/// One OHLCV observation.
///
/// A candle with `confirmed = false` is still open upstream and will be
/// revised; once `confirmed = true` the row is immutable in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Instrument identifier.
    pub symbol: String,
    /// Bucket duration.
    pub timeframe: Timeframe,
    /// Bucket open time, epoch milliseconds, aligned to the timeframe.
    pub ts: i64,
    /// Opening price.
    pub open: Decimal,
    /// Highest price in the bucket.
    pub high: Decimal,
    /// Lowest price in the bucket.
    pub low: Decimal,
    /// Closing price (latest trade while the bucket is open).
    pub close: Decimal,
    /// Base-currency volume.
    pub volume: Decimal,
    /// Quote-currency volume.
    pub quote_volume: Decimal,
    /// Whether the exchange has closed this bucket.
    pub confirmed: bool,
    /// Ingestion wall-clock time.
    pub received_at: DateTime<Utc>,
    /// Where this candle entered the pipeline.
    pub source: CandleSource,
}

impl Candle {
    /// Returns the uniqueness key for this candle.
    #[must_use]
    pub fn key(&self) -> CandleKey {
        CandleKey {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            ts: self.ts,
        }
    }

    /// Returns true if the OHLCV fields match, ignoring delivery metadata.
    #[must_use]
    pub fn same_values(&self, other: &Self) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }

    /// Checks the OHLC, positivity, and timestamp-bound invariants.
    ///
    /// `now_ms` is passed in so the future-timestamp bound is testable
    /// without a clock.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self, now_ms: i64) -> Result<(), ValidationError> {
        if self.low <= Decimal::ZERO {
            return Err(ValidationError::NonPositivePrice { low: self.low });
        }
        if self.volume < Decimal::ZERO {
            return Err(ValidationError::NegativeVolume {
                volume: self.volume,
            });
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high {
            return Err(ValidationError::OhlcOrdering {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }
        if !self.timeframe.is_aligned(self.ts) {
            return Err(ValidationError::Misaligned {
                ts: self.ts,
                timeframe: self.timeframe,
            });
        }
        // One bucket of clock skew is tolerated: the exchange stamps a candle
        // with its open time, which can lead the local clock slightly.
        let upper = now_ms + self.timeframe.duration_ms();
        if self.ts < SYSTEM_EPOCH_MS || self.ts > upper {
            return Err(ValidationError::TimestampOutOfBounds {
                ts: self.ts,
                upper,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> Candle {
        Candle {
            symbol: "BTC-USDT-SWAP".to_string(),
            timeframe: Timeframe::Minute5,
            ts: 1_704_067_500_000,
            open: dec!(42000.5),
            high: dec!(42100),
            low: dec!(41950),
            close: dec!(42050),
            volume: dec!(12.5),
            quote_volume: dec!(525600),
            confirmed: true,
            received_at: Utc::now(),
            source: CandleSource::Stream,
        }
    }

    const NOW: i64 = 1_704_070_000_000;

    #[test]
    fn test_valid_candle() {
        assert!(sample().validate(NOW).is_ok());
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let mut candle = sample();
        candle.low = dec!(0);
        assert!(matches!(
            candle.validate(NOW),
            Err(ValidationError::NonPositivePrice { .. })
        ));
    }

    #[test]
    fn test_ohlc_ordering_rejected() {
        let mut candle = sample();
        candle.high = dec!(41000);
        assert!(matches!(
            candle.validate(NOW),
            Err(ValidationError::OhlcOrdering { .. })
        ));

        let mut candle = sample();
        candle.low = dec!(42060);
        // low above both open and close
        candle.high = dec!(42100);
        assert!(candle.validate(NOW).is_err());
    }

    #[test]
    fn test_misaligned_timestamp_rejected() {
        let mut candle = sample();
        candle.ts += 1;
        assert!(matches!(
            candle.validate(NOW),
            Err(ValidationError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_timestamp_bounds() {
        let mut candle = sample();
        candle.ts = SYSTEM_EPOCH_MS - candle.timeframe.duration_ms();
        assert!(matches!(
            candle.validate(NOW),
            Err(ValidationError::TimestampOutOfBounds { .. })
        ));

        // One bucket into the future is allowed, two is not.
        let step = Timeframe::Minute5.duration_ms();
        let mut candle = sample();
        candle.ts = Timeframe::Minute5.align(NOW) + step;
        assert!(candle.validate(NOW).is_ok());
        candle.ts += 2 * step;
        assert!(candle.validate(NOW).is_err());
    }

    #[test]
    fn test_same_values_ignores_metadata() {
        let a = sample();
        let mut b = sample();
        b.confirmed = false;
        b.source = CandleSource::Backfill;
        assert!(a.same_values(&b));
        b.close = dec!(1);
        assert!(!a.same_values(&b));
    }
}
