//! Walk-forward validation command

use anyhow::Result;
use coin_trader::optimizer::SearchOptions;
use coin_trader::params::format_params;
use coin_trader::walk_forward::{walk_forward, WalkForwardSettings, WalkForwardSummary, WindowMode};
use coin_trader::Config;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info};

use super::{load_coin, rule, settings};

pub struct Args {
    pub coin: String,
    pub mode: WindowMode,
    pub train_years: u32,
    pub test_months: u32,
    pub periods: usize,
    pub robust: bool,
    pub cash: Option<f64>,
}

fn pct(value: Option<f64>, missing: &str) -> String {
    match value {
        Some(v) => format!("{:.2}%", v),
        None => missing.to_string(),
    }
}

fn print_summary(name: &str, args: &Args, summary: &WalkForwardSummary) {
    println!("\n{}", rule(100));
    println!(
        "WALK-FORWARD: {} ({}, train {}y / test {}m, {})",
        name.to_uppercase(),
        args.mode,
        args.train_years,
        args.test_months,
        if args.robust { "robust" } else { "composite" }
    );
    println!("{}", rule(100));

    if summary.windows.is_empty() {
        println!("No window had enough data to evaluate.");
        println!("{}", rule(100));
        return;
    }

    println!(
        "{:<48} {:>10} {:>10} {:>10} {:>10}",
        "Window", "Train", "MinROR", "Test", "Eff."
    );
    println!("{}", "-".repeat(100));
    for w in &summary.windows {
        println!(
            "{:<48} {:>10} {:>10} {:>10} {:>10}",
            w.window.to_string(),
            format!("{:.2}%", w.train.ror),
            pct(w.train.min_ror, "-"),
            pct(w.test.as_ref().map(|t| t.ror), "No trade"),
            w.efficiency
                .map_or_else(|| "N/A".to_string(), |e| format!("{:.2}", e))
        );
    }
    println!("{}", "-".repeat(100));

    println!("Mean test ROR:     {}", pct(summary.mean_test_ror, "N/A"));
    match summary.mean_efficiency {
        Some(e) => println!("Mean efficiency:   {:.2}", e),
        None => println!("Mean efficiency:   N/A"),
    }
    println!(
        "Positive windows:  {}/{}",
        summary.positive_windows, summary.tested_windows
    );
    if let Some(risk) = summary.risk {
        println!("Overfitting risk:  {}", risk.describe());
    }

    println!("\nSelected parameters per window:");
    for w in &summary.windows {
        println!(
            "  {} ~ {}: {}",
            w.window.train_start.format("%Y-%m"),
            w.window.train_end.format("%Y-%m"),
            format_params(&w.best_params)
        );
    }
    println!(
        "EMA periods {}",
        if summary.ema_stable {
            "stable across windows"
        } else {
            "changed between windows"
        }
    );
    println!("{}", rule(100));
}

pub fn run(config: Config, args: Args, cancel: Arc<AtomicBool>) -> Result<()> {
    let names = config.select_coins(&args.coin)?;
    let wf_settings = WalkForwardSettings {
        mode: args.mode,
        train_years: args.train_years,
        test_months: args.test_months,
        robust: args.robust,
        robust_periods: args.periods,
        backtest: settings(&config, args.cash),
        search: config.search.clone(),
    };
    let grid = config.grid();
    let opts = SearchOptions {
        top_k: config.search.top_k,
        show_progress: true,
        cancel,
    };

    for name in &names {
        if opts.is_cancelled() {
            break;
        }
        let coin_data = match load_coin(&config, name, None) {
            Ok(data) => data,
            Err(e) if names.len() > 1 => {
                error!("Skipping {}: {:#}", name, e);
                println!("\n{}: skipped ({:#})", name.to_uppercase(), e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let summary = walk_forward(
            &coin_data.coin.symbol(),
            &coin_data.candles,
            &wf_settings,
            &grid,
            &opts,
        )?;
        print_summary(&coin_data.name, &args, &summary);
    }

    if opts.is_cancelled() {
        println!("\nWalk-forward interrupted; results above cover completed windows.");
    }

    info!("Walk-forward completed");
    Ok(())
}
