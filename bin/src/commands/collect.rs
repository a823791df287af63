//! `candela collect` - run the live pipeline until interrupted.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use candela_collect::{StatusAggregator, Supervisor};
use candela_process::{bounded, report_loop, BatchProcessor, DlqConsumer, PipelineMetrics};
use candela_store::PgStore;
use candela_types::Timeframe;
use chrono::Utc;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;

/// Runs collector, batch processor, dead-letter consumer and metrics
/// reporter until ctrl-c, then drains and stops.
pub(crate) async fn collect(config: Config, symbols: Option<Vec<String>>) -> Result<()> {
    let symbols = symbols.unwrap_or_else(|| config.symbols.clone());
    anyhow::ensure!(!symbols.is_empty(), "no symbols to collect");
    let timeframes: BTreeSet<Timeframe> = config.timeframes.iter().copied().collect();

    let store = Arc::new(
        PgStore::connect(&config.database_url, config.max_connections)
            .await
            .context("candle store is unreachable")?,
    );
    store.ensure_schema().await?;
    let now_ms = Utc::now().timestamp_millis();
    store.ensure_partitions(now_ms, now_ms).await?;

    let (work_tx, work_rx) = bounded(config.queue_capacity);
    let (dlq_tx, dlq_rx) = bounded(config.queue_capacity);
    let metrics = PipelineMetrics::shared();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor = BatchProcessor::new(
        Arc::clone(&store),
        work_rx,
        dlq_tx.clone(),
        Arc::clone(&metrics),
        config.batch_config(),
    );
    let processor_task = tokio::spawn(processor.run(shutdown_rx.clone()));

    let dlq_consumer = DlqConsumer::new(
        Arc::clone(&store),
        dlq_rx,
        work_tx.clone(),
        Arc::clone(&metrics),
        config.dlq_config(),
    );
    let dlq_task = tokio::spawn(dlq_consumer.run(shutdown_rx.clone()));

    let metrics_task = tokio::spawn(report_loop(
        Arc::clone(&metrics),
        work_tx.clone(),
        dlq_tx,
        Duration::from_secs(config.metrics_interval_secs),
        shutdown_rx.clone(),
    ));

    let (status_tx, _snapshot_rx, aggregator) = StatusAggregator::new(256);
    let aggregator_task = tokio::spawn(aggregator.run(shutdown_rx));

    let mut supervisor = Supervisor::new(
        config.worker_config(),
        work_tx,
        Arc::clone(&metrics),
        status_tx,
    );
    for symbol in &symbols {
        supervisor.subscribe(symbol, timeframes.clone()).await;
    }
    info!(
        symbols = symbols.len(),
        timeframes = timeframes.len(),
        "collector running, ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    // Stop producers first so the processor's drain sees the whole queue.
    supervisor.shutdown().await;
    let _ = shutdown_tx.send(true);
    for task in [processor_task, dlq_task, metrics_task, aggregator_task] {
        let _ = task.await;
    }

    let snapshot = metrics.snapshot();
    info!(
        received = snapshot.received,
        processed = snapshot.processed,
        rejected = snapshot.rejected,
        dropped = snapshot.dropped,
        permanent_failures = snapshot.permanent_failures,
        "collector stopped"
    );
    Ok(())
}
