//! `candela maintain` - one-shot reconciliation over a recent window.

use std::sync::Arc;

use anyhow::{Context, Result};
use candela_fetch::RestClient;
use candela_reconcile::{find_gaps, ReconcileEngine};
use candela_store::{CandleStore, PgStore};
use candela_types::{Timeframe, TimeRange};
use chrono::Utc;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;

const MS_PER_HOUR: i64 = 3_600_000;

/// Reconciles the trailing window for the given (or discovered) symbols.
pub(crate) async fn maintain(
    config: Config,
    symbols: Option<Vec<String>>,
    hours: Option<u64>,
    timeframes: Option<Vec<Timeframe>>,
    dry_run: bool,
) -> Result<()> {
    let hours = hours.unwrap_or(config.lookback_hours);
    let now_ms = Utc::now().timestamp_millis();
    let window = TimeRange::new(now_ms - (hours as i64) * MS_PER_HOUR, now_ms)?;
    let timeframes = timeframes.unwrap_or_else(|| Timeframe::reconcile_defaults().to_vec());

    let store = Arc::new(
        PgStore::connect(&config.database_url, config.max_connections)
            .await
            .context("candle store is unreachable")?,
    );

    // No explicit scope: cover every symbol with recent data.
    let symbols = match symbols {
        Some(symbols) => symbols,
        None => {
            let discovered = store.active_symbols(window.start_ms).await?;
            if discovered.is_empty() {
                config.symbols.clone()
            } else {
                discovered
            }
        }
    };
    info!(symbols = symbols.len(), hours, "maintenance window");

    if dry_run {
        return report_gaps(&*store, &symbols, &timeframes, window, &config).await;
    }

    store.ensure_schema().await?;
    store.ensure_partitions(window.start_ms, window.end_ms).await?;

    let source = Arc::new(RestClient::new(config.rest_config())?);
    let engine = ReconcileEngine::new(store, source, config.reconcile_config());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let report = engine.run(&symbols, &timeframes, window, cancel_rx).await;
    println!("{report}");
    anyhow::ensure!(
        report.is_clean(),
        "maintenance finished with {} errors and {} gaps remaining",
        report.total_errors(),
        report.gaps_remaining()
    );
    Ok(())
}

/// Prints what a run would fetch, without touching the exchange or the
/// table.
async fn report_gaps(
    store: &dyn CandleStore,
    symbols: &[String],
    timeframes: &[Timeframe],
    window: TimeRange,
    config: &Config,
) -> Result<()> {
    let now_ms = Utc::now().timestamp_millis();
    let mut total = 0usize;
    for symbol in symbols {
        for &timeframe in timeframes {
            let range = window.aligned(timeframe);
            if range.start_ms >= range.end_ms {
                continue;
            }
            let existing = store.existing_timestamps(symbol, timeframe, range).await?;
            let invalid = store.invalid_timestamps(symbol, timeframe, range).await?;
            let gaps = find_gaps(
                range,
                timeframe,
                &existing,
                &invalid,
                config.merge_distance,
                now_ms,
            );
            for gap in &gaps {
                println!("{symbol} {timeframe}: {gap}");
            }
            total += gaps.len();
        }
    }
    println!("dry run: {total} gap(s) would be fetched");
    Ok(())
}
