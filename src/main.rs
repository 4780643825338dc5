//! Coin trader - main entry point
//!
//! This binary provides five subcommands:
//! - backtest: Run the configured parameters over historical data
//! - optimize: Two-stage grid search with composite scoring
//! - robust: Two-stage grid search scored across sub-periods
//! - walk-forward: Train/test validation of the search
//! - live: Run live trading (paper or real)

use anyhow::Result;
use clap::{Parser, Subcommand};
use coin_trader::walk_forward::WindowMode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "coin-trader")]
#[command(about = "Futures trend strategy with backtesting, parameter search and live trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Backtest the configured parameters
    Backtest {
        /// Coin name or "all"
        #[arg(long, default_value = "all")]
        coin: String,

        /// Data file (overrides the coin's configured file)
        #[arg(long)]
        data: Option<PathBuf>,

        /// Initial cash
        #[arg(long)]
        cash: Option<f64>,
    },

    /// Two-stage grid search
    Optimize {
        /// Coin name
        #[arg(long)]
        coin: String,

        /// Number of top results to show
        #[arg(long, default_value = "10")]
        top: usize,

        /// Initial cash
        #[arg(long)]
        cash: Option<f64>,
    },

    /// Grid search scored for consistency across sub-periods
    Robust {
        /// Coin name
        #[arg(long)]
        coin: String,

        /// Number of sub-periods
        #[arg(long, default_value = "5")]
        periods: usize,

        /// Number of top results to show
        #[arg(long, default_value = "10")]
        top: usize,

        /// Initial cash
        #[arg(long)]
        cash: Option<f64>,
    },

    /// Walk-forward validation
    WalkForward {
        /// Coin name or "all"
        #[arg(long)]
        coin: String,

        /// Window mode (anchored or rolling)
        #[arg(long, default_value = "anchored")]
        mode: WindowMode,

        /// Train window length in years
        #[arg(long = "train_years", alias = "train-years", default_value = "2")]
        train_years: u32,

        /// Test window length in months
        #[arg(long = "test_months", alias = "test-months", default_value = "12")]
        test_months: u32,

        /// Sub-periods per train window for robustness scoring
        #[arg(long, default_value = "4")]
        periods: usize,

        /// Use plain composite scoring on train windows
        #[arg(long)]
        no_robust: bool,

        /// Initial cash
        #[arg(long)]
        cash: Option<f64>,
    },

    /// Run live trading
    Live {
        /// Paper trading mode (safe, no real money)
        #[arg(long, conflicts_with = "live", required_unless_present = "live")]
        paper: bool,

        /// Live trading mode (CAUTION - REAL MONEY!)
        #[arg(long)]
        live: bool,

        /// Cycle interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Closed-trade journal path
        #[arg(long)]
        journal: Option<PathBuf>,
    },
}

/// Filter plus file layer, with a console layer unless `file_only`
fn build_subscriber(
    env_filter: EnvFilter,
    dir: &Path,
    log_filename: &str,
    file_only: bool,
) -> impl tracing::Subscriber + Send + Sync {
    let file_appender = tracing_appender::rolling::never(dir, log_filename);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    // Search commands keep the console for the progress bar
    let console_layer = (!file_only).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    let log_dir = Path::new("logs");
    std::fs::create_dir_all(log_dir)?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    build_subscriber(env_filter, log_dir, &log_filename, file_only).try_init()?;

    if !file_only {
        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

/// Flag set on the first Ctrl-C
fn interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current work");
            eprintln!("\nInterrupted, stopping...");
            handler.store(true, Ordering::SeqCst);
        }
    });
    flag
}

/// Run a CPU-bound command off the async runtime
async fn blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Backtest { .. } => ("backtest", false),
        Commands::Optimize { .. } => ("optimize", true),
        Commands::Robust { .. } => ("robust", true),
        Commands::WalkForward { .. } => ("walk_forward", true),
        Commands::Live { .. } => ("live", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    let config = coin_trader::Config::load(cli.config.as_deref())?;
    let cancel = interrupt_flag();

    match cli.command {
        Commands::Backtest { coin, data, cash } => {
            blocking(move || commands::backtest::run(config, coin, data, cash)).await
        }

        Commands::Optimize { coin, top, cash } => {
            blocking(move || commands::optimize::run(config, coin, top, cash, cancel)).await
        }

        Commands::Robust {
            coin,
            periods,
            top,
            cash,
        } => {
            blocking(move || commands::robust::run(config, coin, periods, top, cash, cancel)).await
        }

        Commands::WalkForward {
            coin,
            mode,
            train_years,
            test_months,
            periods,
            no_robust,
            cash,
        } => {
            let args = commands::walk_forward::Args {
                coin,
                mode,
                train_years,
                test_months,
                periods,
                robust: !no_robust,
                cash,
            };
            blocking(move || commands::walk_forward::run(config, args, cancel)).await
        }

        Commands::Live {
            paper,
            live,
            interval,
            journal,
        } => commands::live::run(config, paper, live, interval, journal, cancel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logged_to_file(file_only: bool) -> String {
        let dir = tempfile::tempdir().unwrap();
        let subscriber = build_subscriber(EnvFilter::new("info"), dir.path(), "test.log", file_only);
        tracing::subscriber::with_default(subscriber, || {
            info!("window finished");
            tracing::debug!("filtered out");
        });
        std::fs::read_to_string(dir.path().join("test.log")).unwrap()
    }

    #[test]
    fn test_file_only_logging_writes_log_file() {
        let contents = logged_to_file(true);
        assert!(contents.contains("window finished"));
        assert!(!contents.contains("filtered out"));
    }

    #[test]
    fn test_console_logging_also_writes_log_file() {
        let contents = logged_to_file(false);
        assert!(contents.contains("window finished"));
        assert!(!contents.contains("filtered out"));
    }
}
