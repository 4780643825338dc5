//! Live trading command

use anyhow::{Context, Result};
use coin_trader::binance::BinanceFutures;
use coin_trader::exchange::{Exchange, PaperExchange};
use coin_trader::journal::TradeJournal;
use coin_trader::notify;
use coin_trader::trader::{CoinTrader, Trader, TraderSettings};
use coin_trader::Config;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub async fn run(
    config: Config,
    paper: bool,
    live: bool,
    interval: Option<u64>,
    journal: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    if !paper && !live {
        anyhow::bail!("Must specify either --paper or --live mode");
    }

    let mut coins = Vec::new();
    for name in config.live_coins()? {
        let coin = config.coin(&name)?;
        coins.push(CoinTrader::from_config(&name, coin)?);
    }
    if coins.is_empty() {
        anyhow::bail!("No coins configured for live trading");
    }

    let exchange: Arc<dyn Exchange> = if live {
        let binance = BinanceFutures::new(&config.exchange)?;
        if !binance.has_credentials() {
            anyhow::bail!("Live mode needs BINANCE_API_KEY and BINANCE_API_SECRET");
        }
        for coin in &coins {
            binance.set_precision(&coin.symbol, coin.quantity_precision);
        }

        warn!("⚠️  LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("Press Ctrl+C within 5 seconds to abort...");
        tokio::time::sleep(Duration::from_secs(5)).await;
        if cancel.load(Ordering::SeqCst) {
            info!("Aborted before trading started");
            return Ok(());
        }
        Arc::new(binance)
    } else {
        let feed = BinanceFutures::new(&config.exchange)?;
        let settings = &config.backtest.settings;
        info!(
            cash = settings.initial_cash,
            fee = settings.commission,
            "Paper trading against live prices"
        );
        Arc::new(
            PaperExchange::new(settings.initial_cash, settings.commission)
                .with_feed(Arc::new(feed)),
        )
    };

    let journal_path = journal.unwrap_or_else(|| PathBuf::from(&config.live.journal_path));
    let journal = TradeJournal::open(&journal_path)
        .with_context(|| format!("Failed to open trade journal {}", journal_path.display()))?;
    info!("Trade journal: {}", journal_path.display());

    let notifier = notify::from_config(config.live.telegram.as_ref())?;
    let interval = Duration::from_secs(interval.unwrap_or(config.live.interval_secs));

    info!(
        mode = if live { "live" } else { "paper" },
        coins = ?coins.iter().map(|c| c.symbol.to_string()).collect::<Vec<_>>(),
        interval_secs = interval.as_secs(),
        timeframe = %config.live.timeframe,
        "Starting trader"
    );

    let mut trader = Trader::new(
        exchange,
        notifier,
        Some(journal),
        coins,
        TraderSettings::from(&config.live),
    );
    trader.run(interval, cancel).await;

    if let Some(summary) = trader.journal().map(|j| j.summary()).transpose()? {
        info!(
            trades = summary.trades,
            wins = summary.wins,
            total_pnl = summary.total_pnl,
            "Journal totals"
        );
    }

    Ok(())
}
