//! candela CLI - OKX candle collection, storage and reconciliation.

use anyhow::Result;
use candela_types::Timeframe;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "candela")]
#[command(about = "OKX candle collection, storage and reconciliation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: candela.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (warnings and errors only, no progress output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream live candles into the store until interrupted
    Collect {
        /// Symbols to subscribe (default: configured symbols)
        #[arg(short, long, value_delimiter = ',')]
        symbols: Option<Vec<String>>,
    },

    /// Detect and repair gaps over a recent window
    Maintain {
        /// Symbols to reconcile (default: symbols with recent data)
        #[arg(short, long, value_delimiter = ',')]
        symbols: Option<Vec<String>>,

        /// Lookback window in hours (default: configured lookback)
        #[arg(long)]
        hours: Option<u64>,

        /// Timeframes to reconcile (e.g. 5m,1h,1d)
        #[arg(short, long, value_delimiter = ',')]
        timeframes: Option<Vec<Timeframe>>,

        /// Report gaps without fetching anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Load history for one symbol through the reconciliation engine
    Backfill {
        /// Symbol to backfill (e.g. BTC-USDT-SWAP)
        symbol: String,

        /// Timeframes to backfill (e.g. 5m,1h,1d)
        #[arg(short, long, value_delimiter = ',')]
        timeframes: Option<Vec<Timeframe>>,

        /// Window size in days (default: 30)
        #[arg(short, long, conflicts_with = "months")]
        days: Option<u32>,

        /// Window size in calendar months
        #[arg(short, long)]
        months: Option<u32>,

        /// Print the fetch plan without touching anything
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Collect { symbols } => commands::collect::collect(config, symbols).await,
        Commands::Maintain {
            symbols,
            hours,
            timeframes,
            dry_run,
        } => commands::maintain::maintain(config, symbols, hours, timeframes, dry_run).await,
        Commands::Backfill {
            symbol,
            timeframes,
            days,
            months,
            dry_run,
        } => {
            commands::backfill::backfill(
                config, symbol, timeframes, days, months, dry_run, cli.quiet,
            )
            .await
        }
    }
}
