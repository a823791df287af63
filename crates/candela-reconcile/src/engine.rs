//! The reconciliation engine: detect gaps, fetch, write, verify.

use std::sync::Arc;
use std::time::Duration;

use candela_fetch::HistoricalSource;
use candela_store::CandleStore;
use candela_types::{Timeframe, TimeRange};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::gaps::{find_gaps, GapInterval};
use crate::report::{RunReport, SymbolReport};

/// Tuning for a reconciliation run.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Runs of missing timestamps separated by at most this many present
    /// candles are fetched as one interval (one page covers 100 rows).
    pub merge_distance: usize,
    /// Fetch attempts per gap before deferring it to the next run.
    pub max_gap_retries: u32,
    /// Pause between attempts on the same gap.
    pub retry_delay: Duration,
    /// (symbol, timeframe) pairs reconciled concurrently.
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            merge_distance: 100,
            max_gap_retries: 3,
            retry_delay: Duration::from_secs(2),
            concurrency: 2,
        }
    }
}

/// Drives gap detection and corrective fetching over a window.
///
/// Writes go through the same store upsert as the live pipeline, so the
/// conflict rules are identical for both paths.
#[derive(Debug)]
pub struct ReconcileEngine<S, H> {
    store: Arc<S>,
    source: Arc<H>,
    config: ReconcileConfig,
}

impl<S, H> ReconcileEngine<S, H>
where
    S: CandleStore,
    H: HistoricalSource,
{
    /// Creates an engine over a store and a historical source.
    #[must_use]
    pub const fn new(store: Arc<S>, source: Arc<H>, config: ReconcileConfig) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Reconciles every (symbol, timeframe) pair over the window.
    ///
    /// Pairs run with bounded concurrency; a failing pair never aborts the
    /// rest of the scope. Cancellation is honored between gaps.
    pub async fn run(
        &self,
        symbols: &[String],
        timeframes: &[Timeframe],
        window: TimeRange,
        cancel: watch::Receiver<bool>,
    ) -> RunReport {
        let started_at = Utc::now();
        let t0 = Instant::now();

        let pairs: Vec<(String, Timeframe)> = symbols
            .iter()
            .flat_map(|s| timeframes.iter().map(move |tf| (s.clone(), *tf)))
            .collect();
        info!(pairs = pairs.len(), %window, "reconciliation run starting");

        let reports: Vec<SymbolReport> = futures::stream::iter(pairs)
            .map(|(symbol, timeframe)| {
                let cancel = cancel.clone();
                async move {
                    self.reconcile_pair(&symbol, timeframe, window, &cancel)
                        .await
                }
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let report = RunReport {
            started_at,
            reports,
            duration: t0.elapsed(),
        };
        info!(
            gaps_remaining = report.gaps_remaining(),
            errors = report.total_errors(),
            "reconciliation run finished"
        );
        report
    }

    /// Reconciles one (symbol, timeframe): corrective duplicate pass, gap
    /// detection, then per-gap fetch and verify.
    pub async fn reconcile_pair(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        window: TimeRange,
        cancel: &watch::Receiver<bool>,
    ) -> SymbolReport {
        let t0 = Instant::now();
        let mut report = SymbolReport::new(symbol.to_string(), timeframe);
        let range = window.aligned(timeframe);
        if range.start_ms >= range.end_ms {
            report.duration = t0.elapsed();
            return report;
        }
        report.expected = range.expected_count(timeframe);

        match self.store.collapse_duplicates(symbol, timeframe, range).await {
            Ok(removed) => report.duplicates_removed = removed,
            Err(err) => report.errors.push(format!("duplicate pass: {err}")),
        }

        let existing = match self.store.existing_timestamps(symbol, timeframe, range).await {
            Ok(set) => set,
            Err(err) => {
                report.errors.push(format!("existing timestamps: {err}"));
                report.duration = t0.elapsed();
                return report;
            }
        };
        let invalid = match self.store.invalid_timestamps(symbol, timeframe, range).await {
            Ok(set) => set,
            Err(err) => {
                report.errors.push(format!("invalid timestamps: {err}"));
                report.duration = t0.elapsed();
                return report;
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let gaps = find_gaps(
            range,
            timeframe,
            &existing,
            &invalid,
            self.config.merge_distance,
            now_ms,
        );
        report.gaps_found = gaps.len();
        if gaps.is_empty() {
            debug!(symbol, %timeframe, "window complete");
        } else {
            info!(symbol, %timeframe, gaps = gaps.len(), "gaps detected");
        }

        for gap in gaps {
            if *cancel.borrow() {
                report.errors.push("cancelled".to_string());
                break;
            }
            let stale: Vec<i64> = invalid
                .range(gap.start_ms..gap.end_ms)
                .copied()
                .collect();
            self.fill_gap(symbol, timeframe, gap, &stale, &mut report)
                .await;
        }

        report.duration = t0.elapsed();
        report
    }

    async fn fill_gap(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        gap: GapInterval,
        stale: &[i64],
        report: &mut SymbolReport,
    ) {
        // Invalid rows may be confirmed; delete them so replacements land.
        if !stale.is_empty() {
            match self.store.delete_candles(symbol, timeframe, stale).await {
                Ok(removed) => report.invalid_removed += removed,
                Err(err) => {
                    report.errors.push(format!("gap {gap}: delete invalid: {err}"));
                    return;
                }
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            report.fetch_calls += 1;
            let result = match self.source.fetch_range(symbol, timeframe, gap.range()).await {
                Ok(candles) => self
                    .store
                    .upsert_candles(&candles)
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            match result {
                Ok(outcome) => {
                    report.candles_written += outcome.applied();
                    report.rejected += outcome.rejected.len() as u64;
                    self.verify_gap(symbol, timeframe, gap, report).await;
                    return;
                }
                Err(err) => {
                    warn!(symbol, %timeframe, %gap, attempt, err, "gap fill attempt failed");
                    if attempt >= self.config.max_gap_retries {
                        report.errors.push(format!("gap {gap}: {err}"));
                        return;
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    /// A gap counts as filled only when every expected timestamp is now
    /// present; a short fetch defers the remainder to the next run.
    async fn verify_gap(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        gap: GapInterval,
        report: &mut SymbolReport,
    ) {
        match self
            .store
            .existing_timestamps(symbol, timeframe, gap.range())
            .await
        {
            Ok(present) => {
                let still_missing = gap
                    .range()
                    .timestamps(timeframe)
                    .filter(|ts| !present.contains(ts))
                    .count();
                if still_missing == 0 {
                    report.gaps_filled += 1;
                } else {
                    report
                        .errors
                        .push(format!("gap {gap}: {still_missing} still missing after fetch"));
                }
            }
            Err(err) => report.errors.push(format!("gap {gap}: verify: {err}")),
        }
    }
}
