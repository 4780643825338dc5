//! Subcommand implementations and shared report helpers

pub mod backtest;
pub mod live;
pub mod optimize;
pub mod robust;
pub mod walk_forward;

use anyhow::{Context, Result};
use coin_trader::backtest::BacktestSettings;
use coin_trader::config::CoinConfig;
use coin_trader::optimizer::Candidate;
use coin_trader::params::{StrategyParams, ENTRY_KNOBS, EXIT_KNOBS};
use coin_trader::{data, Candle, Config, TradeOutcome};
use std::path::PathBuf;
use tracing::info;

/// Everything a search command needs about one coin
pub struct CoinData {
    pub name: String,
    pub coin: CoinConfig,
    pub params: StrategyParams,
    pub candles: Vec<Candle>,
}

/// Resolve a coin and load its candles; unknown coins and missing files are fatal
pub fn load_coin(config: &Config, name: &str, data_override: Option<&PathBuf>) -> Result<CoinData> {
    let name = name.to_lowercase();
    let coin = config.coin(&name)?.clone();
    let params = coin.strategy_params(&name)?;
    let path = match data_override {
        Some(p) => p.clone(),
        None => config.data_path(&name)?,
    };

    let candles =
        data::load_csv(&path).with_context(|| format!("Failed to load data for {}", name))?;
    info!("Loaded {} candles for {} from {}", candles.len(), name, path.display());
    if let Some((start, end)) = data::date_range(&candles) {
        info!("Data range: {} ~ {}", start, end);
    }

    Ok(CoinData {
        name,
        coin,
        params,
        candles,
    })
}

/// Backtest settings with an optional cash override
pub fn settings(config: &Config, cash: Option<f64>) -> BacktestSettings {
    let mut settings = config.backtest.settings.clone();
    if let Some(cash) = cash {
        settings.initial_cash = cash;
    }
    settings
}

pub fn rule(width: usize) -> String {
    "=".repeat(width)
}

/// Ranked table of plain-scored candidates
pub fn print_ranked(title: &str, candidates: &[Candidate<TradeOutcome>], top: usize) {
    let display_count = top.min(candidates.len());
    println!("\n{}", rule(130));
    println!("{} (top {} of {})", title, display_count, candidates.len());
    println!("{}", rule(130));
    println!(
        "{:<4} {:>9} {:>7} {:>8} {:>7} {:>6} {:>7} | Parameters",
        "Rank", "ROR%", "Sharpe", "MaxDD%", "WinR%", "Trades", "Score"
    );
    println!("{}", "-".repeat(130));
    for (i, c) in candidates.iter().take(top).enumerate() {
        println!(
            "{:<4} {:>9.2} {:>7.2} {:>8.2} {:>7.1} {:>6} {:>7.4} | {}",
            i + 1,
            c.stats.ror,
            c.stats.sharpe,
            c.stats.max_drawdown,
            c.stats.win_rate,
            c.stats.trade_count,
            c.score,
            coin_trader::params::format_params(&c.params)
        );
    }
    println!("{}", rule(130));
}

/// Knob values in the form used by the `params` map of a coin entry
pub fn print_param_block(name: &str, params: &StrategyParams) {
    println!("\nBest parameters for {}:", name);
    let map = params.to_map();
    for knob in ENTRY_KNOBS.iter().chain(EXIT_KNOBS.iter()) {
        if let Some(value) = map.get(*knob) {
            println!("  \"{}\": {},", knob, value);
        }
    }
}

pub fn print_outcome(label: &str, outcome: &TradeOutcome) {
    println!("{}", label);
    println!("  ROR:           {:.2}%", outcome.ror);
    println!("  Sharpe:        {:.2}", outcome.sharpe);
    println!("  Max Drawdown:  {:.2}%", outcome.max_drawdown);
    println!("  Win Rate:      {:.1}%", outcome.win_rate);
    println!(
        "  Trades:        {} ({}W / {}L)",
        outcome.trade_count, outcome.won, outcome.lost
    );
    println!("  P/L Ratio:     {:.2}", outcome.pl_ratio);
    println!("  PnL:           {:.2}", outcome.pnl);
    println!("  Final Equity:  {:.2}", outcome.final_equity);
}
