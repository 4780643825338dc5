//! Backtest command implementation

use anyhow::Result;
use coin_trader::backtest::Backtester;
use coin_trader::params::format_params;
use coin_trader::{Config, TradeOutcome};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use super::{load_coin, print_outcome, rule, settings};

pub fn run(
    config: Config,
    coin: String,
    data_override: Option<PathBuf>,
    cash: Option<f64>,
) -> Result<()> {
    let names = config.select_coins(&coin)?;
    let settings = settings(&config, cash);
    info!("Starting backtest for {:?}", names);

    if names.len() > 1 && data_override.is_some() {
        anyhow::bail!("--data can only be used with a single coin");
    }

    let mut summary: Vec<(String, Option<TradeOutcome>)> = Vec::new();

    for name in &names {
        let coin_data = load_coin(&config, name, data_override.as_ref())?;
        let backtester = Backtester::new(
            coin_data.coin.symbol(),
            coin_data.params.clone(),
            settings.clone(),
        );
        let result = backtester.run(&coin_data.candles);

        if names.len() == 1 {
            println!("\n{}", rule(60));
            println!("BACKTEST RESULTS: {}", coin_data.coin.symbol);
            println!("{}", rule(60));
            println!("Parameters: {}", format_params(&coin_data.params));
            println!("Initial Cash: {:.2}", settings.initial_cash);
            match &result.outcome {
                Some(outcome) => {
                    print_outcome("", outcome);
                    let mut by_reason: BTreeMap<&str, usize> = BTreeMap::new();
                    for trade in &result.trades {
                        *by_reason.entry(trade.exit_reason.as_str()).or_default() += 1;
                    }
                    println!("Exit reasons:");
                    for (reason, count) in by_reason {
                        println!("  {:<18} {}", reason, count);
                    }
                }
                None => println!("No trades"),
            }
            println!("{}", rule(60));
        }

        summary.push((coin_data.name, result.outcome));
    }

    if names.len() > 1 {
        println!("\n{}", rule(80));
        println!("BACKTEST SUMMARY");
        println!("{}", rule(80));
        println!(
            "{:<6} {:>9} {:>7} {:>8} {:>7} {:>6} {:>8}",
            "Coin", "ROR%", "Sharpe", "MaxDD%", "WinR%", "Trades", "P/L"
        );
        println!("{}", "-".repeat(80));
        for (name, outcome) in &summary {
            match outcome {
                Some(o) => println!(
                    "{:<6} {:>9.2} {:>7.2} {:>8.2} {:>7.1} {:>6} {:>8.2}",
                    name.to_uppercase(),
                    o.ror,
                    o.sharpe,
                    o.max_drawdown,
                    o.win_rate,
                    o.trade_count,
                    o.pl_ratio
                ),
                None => println!("{:<6} {:>9}", name.to_uppercase(), "no trades"),
            }
        }
        println!("{}", rule(80));
    }

    info!("Backtest completed successfully");
    Ok(())
}
