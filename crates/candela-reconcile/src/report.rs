//! Run reporting for reconciliation passes.

use std::time::Duration;

use candela_types::Timeframe;
use chrono::{DateTime, Utc};

/// Outcome of reconciling one (symbol, timeframe).
#[derive(Debug, Clone)]
pub struct SymbolReport {
    /// Instrument.
    pub symbol: String,
    /// Timeframe.
    pub timeframe: Timeframe,
    /// Expected candles in the window.
    pub expected: usize,
    /// Gap intervals detected.
    pub gaps_found: usize,
    /// Gap intervals fully filled this run.
    pub gaps_filled: usize,
    /// Rows written (inserted or updated).
    pub candles_written: u64,
    /// Duplicate rows removed by the corrective pass.
    pub duplicates_removed: u64,
    /// Invalid rows deleted ahead of refetch.
    pub invalid_removed: u64,
    /// Candles the store refused.
    pub rejected: u64,
    /// Calls made to the historical source.
    pub fetch_calls: u64,
    /// Errors encountered; the run continued past each.
    pub errors: Vec<String>,
    /// Wall-clock time spent on this pair.
    pub duration: Duration,
}

impl SymbolReport {
    /// Starts an empty report for the pair.
    #[must_use]
    pub fn new(symbol: String, timeframe: Timeframe) -> Self {
        Self {
            symbol,
            timeframe,
            expected: 0,
            gaps_found: 0,
            gaps_filled: 0,
            candles_written: 0,
            duplicates_removed: 0,
            invalid_removed: 0,
            rejected: 0,
            fetch_calls: 0,
            errors: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// True when every detected gap was filled and nothing errored.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.gaps_filled == self.gaps_found
    }
}

/// Aggregate outcome of one reconciliation run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Per-pair outcomes, in scope order.
    pub reports: Vec<SymbolReport>,
    /// Total wall-clock time.
    pub duration: Duration,
}

impl RunReport {
    /// Total errors across all pairs.
    #[must_use]
    pub fn total_errors(&self) -> usize {
        self.reports.iter().map(|r| r.errors.len()).sum()
    }

    /// Gaps left unfilled across all pairs.
    #[must_use]
    pub fn gaps_remaining(&self) -> usize {
        self.reports
            .iter()
            .map(|r| r.gaps_found - r.gaps_filled)
            .sum()
    }

    /// True when the whole run completed with nothing outstanding.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.reports.iter().all(SymbolReport::is_clean)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:<16} {:>4}  {:>8}  {:>5}  {:>6}  {:>7}  {:>5}  {:>5}  {:>6}",
            "symbol", "tf", "expected", "gaps", "filled", "written", "dups", "inval", "errors"
        )?;
        for r in &self.reports {
            writeln!(
                f,
                "{:<16} {:>4}  {:>8}  {:>5}  {:>6}  {:>7}  {:>5}  {:>5}  {:>6}",
                r.symbol,
                r.timeframe.as_str(),
                r.expected,
                r.gaps_found,
                r.gaps_filled,
                r.candles_written,
                r.duplicates_removed,
                r.invalid_removed,
                r.errors.len(),
            )?;
        }
        write!(
            f,
            "pairs: {}, gaps remaining: {}, errors: {}, took {:.1?}",
            self.reports.len(),
            self.gaps_remaining(),
            self.total_errors(),
            self.duration,
        )
    }
}
