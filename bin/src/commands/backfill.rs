//! `candela backfill` - historical load through the reconciliation engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use candela_fetch::{RestClient, PAGE_LIMIT};
use candela_reconcile::{ReconcileEngine, RunReport};
use candela_store::PgStore;
use candela_types::{Timeframe, TimeRange, SYSTEM_EPOCH_MS};
use chrono::{Months, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;

/// Backfills one symbol over a day- or month-sized window.
pub(crate) async fn backfill(
    config: Config,
    symbol: String,
    timeframes: Option<Vec<Timeframe>>,
    days: Option<u32>,
    months: Option<u32>,
    dry_run: bool,
    quiet: bool,
) -> Result<()> {
    let timeframes = timeframes.unwrap_or_else(|| Timeframe::reconcile_defaults().to_vec());
    let now = Utc::now();
    let start_ms = match (days, months) {
        (Some(_), Some(_)) => anyhow::bail!("--days and --months are mutually exclusive"),
        (Some(days), None) => now.timestamp_millis() - i64::from(days) * 86_400_000,
        (None, Some(months)) => now
            .checked_sub_months(Months::new(months))
            .context("window start underflows the calendar")?
            .timestamp_millis(),
        (None, None) => now.timestamp_millis() - 30 * 86_400_000,
    };
    let window = TimeRange::new(start_ms.max(SYSTEM_EPOCH_MS), now.timestamp_millis())?;

    if dry_run {
        println!("backfill plan for {symbol}, window {window}:");
        for &timeframe in &timeframes {
            let expected = window.expected_count(timeframe);
            let pages = expected.div_ceil(PAGE_LIMIT as usize);
            println!("  {timeframe}: up to {expected} candles (~{pages} requests)");
        }
        return Ok(());
    }

    let store = Arc::new(
        PgStore::connect(&config.database_url, config.max_connections)
            .await
            .context("candle store is unreachable")?,
    );
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

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(timeframes.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} timeframes {msg}")
                .context("invalid progress template")?
                .progress_chars("=>-"),
        );
        pb.enable_steady_tick(Duration::from_millis(250));
        pb
    };

    info!(%symbol, %window, "backfill starting");
    let started_at = Utc::now();
    let t0 = std::time::Instant::now();
    let mut reports = Vec::with_capacity(timeframes.len());
    for &timeframe in &timeframes {
        progress.set_message(timeframe.as_str().to_string());
        reports.push(
            engine
                .reconcile_pair(&symbol, timeframe, window, &cancel_rx)
                .await,
        );
        progress.inc(1);
        if *cancel_rx.borrow() {
            break;
        }
    }
    let report = RunReport {
        started_at,
        reports,
        duration: t0.elapsed(),
    };
    progress.finish_and_clear();

    println!("{report}");
    anyhow::ensure!(
        report.is_clean(),
        "backfill finished with {} errors and {} gaps remaining",
        report.total_errors(),
        report.gaps_remaining()
    );
    Ok(())
}
