//! Expected-timestamp comparison and gap coalescing.

use std::collections::BTreeSet;

use candela_types::{Timeframe, TimeRange};

/// A contiguous stretch of the timeline needing a corrective fetch.
///
/// Computed on demand and never stored. The half-open bounds may span
/// present candles when nearby runs of missing timestamps were merged;
/// `missing` counts only the timestamps actually absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapInterval {
    /// First missing bucket (inclusive), epoch milliseconds.
    pub start_ms: i64,
    /// End of the last missing bucket (exclusive), epoch milliseconds.
    pub end_ms: i64,
    /// Timestamps absent or invalid within the interval.
    pub missing: usize,
}

impl GapInterval {
    /// The interval as a fetchable range.
    #[must_use]
    pub const fn range(&self) -> TimeRange {
        TimeRange {
            start_ms: self.start_ms,
            end_ms: self.end_ms,
        }
    }
}

impl std::fmt::Display for GapInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}) missing {}", self.start_ms, self.end_ms, self.missing)
    }
}

/// Finds the timestamps in the window that need fetching: expected but
/// absent, or present but invalid. The still-open bucket (and anything
/// later) is excluded — the stream will finish it.
fn needed_timestamps(
    range: TimeRange,
    timeframe: Timeframe,
    existing: &BTreeSet<i64>,
    invalid: &BTreeSet<i64>,
    now_ms: i64,
) -> Vec<i64> {
    range
        .timestamps(timeframe)
        .filter(|ts| ts + timeframe.duration_ms() <= now_ms)
        .filter(|ts| !existing.contains(ts) || invalid.contains(ts))
        .collect()
}

/// Computes maximal gap intervals over the window.
///
/// Runs of needed timestamps separated by at most `merge_distance` present
/// candles coalesce into one interval, so nearby gaps are fixed by one
/// paginated fetch instead of many small ones.
#[must_use]
pub fn find_gaps(
    range: TimeRange,
    timeframe: Timeframe,
    existing: &BTreeSet<i64>,
    invalid: &BTreeSet<i64>,
    merge_distance: usize,
    now_ms: i64,
) -> Vec<GapInterval> {
    let needed = needed_timestamps(range, timeframe, existing, invalid, now_ms);
    let step = timeframe.duration_ms();
    let merge_span = step.saturating_mul(merge_distance as i64 + 1);

    let mut gaps: Vec<GapInterval> = Vec::new();
    for ts in needed {
        match gaps.last_mut() {
            Some(gap) if ts - (gap.end_ms - step) <= merge_span => {
                gap.end_ms = ts + step;
                gap.missing += 1;
            }
            _ => gaps.push(GapInterval {
                start_ms: ts,
                end_ms: ts + step,
                missing: 1,
            }),
        }
    }
    gaps
}
