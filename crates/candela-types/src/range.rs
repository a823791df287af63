//! Millisecond time ranges and expected-timestamp iteration.

use crate::{CandelaError, Timeframe};

/// A half-open time range `[start_ms, end_ms)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Range start (inclusive).
    pub start_ms: i64,
    /// Range end (exclusive).
    pub end_ms: i64,
}

impl TimeRange {
    /// Creates a new range, validating that start < end.
    ///
    /// # Errors
    ///
    /// Returns an error if `start_ms >= end_ms`.
    pub fn new(start_ms: i64, end_ms: i64) -> Result<Self, CandelaError> {
        if start_ms >= end_ms {
            return Err(CandelaError::InvalidRange { start_ms, end_ms });
        }
        Ok(Self { start_ms, end_ms })
    }

    /// Returns this range with both bounds floored to the timeframe grid.
    ///
    /// The end bound stays exclusive: a range ending exactly on a boundary
    /// does not include that boundary's bucket.
    #[must_use]
    pub const fn aligned(&self, timeframe: Timeframe) -> Self {
        Self {
            start_ms: timeframe.align(self.start_ms),
            end_ms: timeframe.align(self.end_ms),
        }
    }

    /// Returns true if the timestamp lies inside the range.
    #[must_use]
    pub const fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }

    /// Iterates the expected candle open timestamps on the timeframe grid.
    ///
    /// Bounds are aligned first, so an unaligned range yields the same
    /// sequence as its aligned counterpart.
    pub fn timestamps(&self, timeframe: Timeframe) -> TimestampIterator {
        let aligned = self.aligned(timeframe);
        TimestampIterator {
            current: aligned.start_ms,
            end: aligned.end_ms,
            step: timeframe.duration_ms(),
        }
    }

    /// Returns the number of expected candles in the range.
    #[must_use]
    pub fn expected_count(&self, timeframe: Timeframe) -> usize {
        self.timestamps(timeframe).len()
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start_ms, self.end_ms)
    }
}

/// Iterator over expected candle open timestamps.
#[derive(Debug, Clone)]
pub struct TimestampIterator {
    current: i64,
    end: i64,
    step: i64,
}

impl Iterator for TimestampIterator {
    type Item = i64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.end {
            return None;
        }
        let result = self.current;
        self.current += self.step;
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.current >= self.end {
            return (0, Some(0));
        }
        let remaining = ((self.end - self.current + self.step - 1) / self.step) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TimestampIterator {}
