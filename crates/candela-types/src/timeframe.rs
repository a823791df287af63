//! Candle timeframe definitions.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Candle bucket duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    /// 1-minute candles.
    #[serde(rename = "1m")]
    Minute1,
    /// 5-minute candles.
    #[serde(rename = "5m")]
    Minute5,
    /// 15-minute candles.
    #[serde(rename = "15m")]
    Minute15,
    /// 1-hour candles.
    #[serde(rename = "1h")]
    Hour1,
    /// 4-hour candles.
    #[serde(rename = "4h")]
    Hour4,
    /// Daily candles.
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    /// Returns the bucket duration in milliseconds.
    #[must_use]
    pub const fn duration_ms(&self) -> i64 {
        match self {
            Self::Minute1 => 60_000,
            Self::Minute5 => 300_000,
            Self::Minute15 => 900_000,
            Self::Hour1 => 3_600_000,
            Self::Hour4 => 14_400_000,
            Self::Day1 => 86_400_000,
        }
    }

    /// Returns the timeframe as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Minute1 => "1m",
            Self::Minute5 => "5m",
            Self::Minute15 => "15m",
            Self::Hour1 => "1h",
            Self::Hour4 => "4h",
            Self::Day1 => "1d",
        }
    }

    /// Returns the exchange bar identifier (OKX uses uppercase hour/day suffixes).
    #[must_use]
    pub const fn bar(&self) -> &'static str {
        match self {
            Self::Minute1 => "1m",
            Self::Minute5 => "5m",
            Self::Minute15 => "15m",
            Self::Hour1 => "1H",
            Self::Hour4 => "4H",
            Self::Day1 => "1D",
        }
    }

    /// Returns the push-feed channel name for this timeframe (e.g. `candle5m`).
    #[must_use]
    pub fn channel(&self) -> String {
        format!("candle{}", self.bar())
    }

    /// Resolves a push-feed channel name back to a timeframe.
    #[must_use]
    pub fn from_channel(channel: &str) -> Option<Self> {
        let bar = channel.strip_prefix("candle")?;
        Self::all().iter().copied().find(|tf| tf.bar() == bar)
    }

    /// Floors a millisecond timestamp to this timeframe's boundary.
    #[must_use]
    pub const fn align(&self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.duration_ms())
    }

    /// Returns true if the timestamp falls exactly on a bucket boundary.
    #[must_use]
    pub const fn is_aligned(&self, ts_ms: i64) -> bool {
        ts_ms.rem_euclid(self.duration_ms()) == 0
    }

    /// Returns all supported timeframes, shortest first.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Minute1,
            Self::Minute5,
            Self::Minute15,
            Self::Hour1,
            Self::Hour4,
            Self::Day1,
        ]
    }

    /// Default set covered by scheduled reconciliation runs.
    #[must_use]
    pub const fn reconcile_defaults() -> &'static [Self] {
        &[
            Self::Minute5,
            Self::Minute15,
            Self::Hour1,
            Self::Hour4,
            Self::Day1,
        ]
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = TimeframeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1m" | "m1" => Ok(Self::Minute1),
            "5m" | "m5" => Ok(Self::Minute5),
            "15m" | "m15" => Ok(Self::Minute15),
            "1h" | "h1" => Ok(Self::Hour1),
            "4h" | "h4" => Ok(Self::Hour4),
            "1d" | "d1" | "daily" => Ok(Self::Day1),
            _ => Err(TimeframeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid timeframe string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeframeParseError(pub(crate) String);

impl std::fmt::Display for TimeframeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid timeframe '{}', expected one of: 1m, 5m, 15m, 1h, 4h, 1d",
            self.0
        )
    }
}

impl std::error::Error for TimeframeParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_ms() {
        assert_eq!(Timeframe::Minute1.duration_ms(), 60_000);
        assert_eq!(Timeframe::Minute5.duration_ms(), 300_000);
        assert_eq!(Timeframe::Hour4.duration_ms(), 14_400_000);
        assert_eq!(Timeframe::Day1.duration_ms(), 86_400_000);
    }

    #[test]
    fn test_parse() {
        assert_eq!("5m".parse::<Timeframe>().unwrap(), Timeframe::Minute5);
        assert_eq!("1H".parse::<Timeframe>().unwrap(), Timeframe::Hour1);
        assert_eq!("1d".parse::<Timeframe>().unwrap(), Timeframe::Day1);
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_channel_round_trip() {
        for tf in Timeframe::all() {
            assert_eq!(Timeframe::from_channel(&tf.channel()), Some(*tf));
        }
        assert_eq!(Timeframe::from_channel("candle3m"), None);
        assert_eq!(Timeframe::from_channel("tickers"), None);
    }

    #[test]
    fn test_align() {
        // 2024-01-01T00:07:31Z floors to 00:05 on the 5m grid.
        let ts = 1_704_067_651_000;
        assert_eq!(Timeframe::Minute5.align(ts), 1_704_067_500_000);
        assert!(Timeframe::Minute5.is_aligned(1_704_067_500_000));
        assert!(!Timeframe::Minute5.is_aligned(ts));
    }
}
