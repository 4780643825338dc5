//! Robust command: search scored for consistency across sub-periods

use anyhow::Result;
use coin_trader::optimizer::{two_stage, Candidate, SearchOptions};
use coin_trader::params::format_params;
use coin_trader::robust::{split_periods, RobustEvaluator, RobustStats};
use coin_trader::slices::SliceArena;
use coin_trader::{Config, StrategyParams};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

use super::{load_coin, print_param_block, rule, settings};

fn print_robust_table(title: &str, candidates: &[Candidate<RobustStats>], top: usize) {
    let display_count = top.min(candidates.len());
    println!("\n{}", rule(140));
    println!("{} (top {} of {})", title, display_count, candidates.len());
    println!("{}", rule(140));
    println!(
        "{:<4} {:>8} {:>8} {:>7} {:>6} {:<36} {:>7} | Parameters",
        "Rank", "AvgROR%", "MinROR%", "Std", "Loss", "Period RORs", "Score"
    );
    println!("{}", "-".repeat(140));
    for (i, c) in candidates.iter().take(top).enumerate() {
        let periods = c
            .stats
            .period_rors
            .iter()
            .map(|r| format!("{:.1}", r))
            .collect::<Vec<_>>()
            .join("/");
        println!(
            "{:<4} {:>8.2} {:>8.2} {:>7.2} {:>3}/{:<2} {:<36} {:>7.4} | {}",
            i + 1,
            c.stats.avg_ror,
            c.stats.min_ror,
            c.stats.std_ror,
            c.stats.loss_count,
            c.stats.periods(),
            periods,
            c.score,
            format_params(&c.params)
        );
    }
    println!("{}", rule(140));
}

pub fn run(
    config: Config,
    coin: String,
    periods: usize,
    top: usize,
    cash: Option<f64>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let coin_data = load_coin(&config, &coin, None)?;
    let settings = settings(&config, cash);
    let grid = config.grid();

    let mut arena = SliceArena::new()?;
    let split = split_periods(
        &coin_data.candles,
        periods,
        config.search.min_period_rows,
        &mut arena,
    )?;
    if split.len() < 2 {
        anyhow::bail!(
            "{} candles only give {} sub-period(s) of at least {} rows; need 2 or more",
            coin_data.candles.len(),
            split.len(),
            config.search.min_period_rows
        );
    }

    println!("\n{}", rule(70));
    println!("ROBUST OPTIMIZATION: {}", coin_data.coin.symbol);
    println!("{}", rule(70));
    for (i, period) in split.iter().enumerate() {
        println!(
            "  Period {}:      {} ({} candles)",
            i + 1,
            period.label,
            period.candles.len()
        );
    }
    println!(
        "  Min trades:    {} per period",
        config.search.robust_min_trades
    );
    println!("{}\n", rule(70));

    let evaluator = RobustEvaluator::new(
        coin_data.coin.symbol(),
        &split,
        settings,
        config.search.robust_min_trades,
    );
    let opts = SearchOptions {
        top_k: config.search.top_k,
        show_progress: true,
        cancel,
    };
    let report = two_stage(&evaluator, &StrategyParams::default(), &grid, &opts);

    if report.cancelled {
        println!("\nSearch interrupted; showing completed results.");
    }

    print_robust_table("STAGE 1 (entry parameters)", &report.stage1, top);
    let Some(best) = report.best() else {
        println!(
            "\nNo parameter set traded at least {} times in every period.",
            config.search.robust_min_trades
        );
        info!("Robust optimization finished without viable results");
        return Ok(());
    };
    print_robust_table("STAGE 2 (exit parameters)", &report.stage2, top);

    println!("\nCurrent: {}", format_params(&coin_data.params));
    println!("Best:    {}", format_params(&best.params));

    let current = evaluator.per_period(&coin_data.params);
    let proposed = evaluator.per_period(&best.params);
    println!("\n{:<18} {:>10} {:>10}", "Period", "Current%", "Best%");
    println!("{}", "-".repeat(40));
    for ((period, cur), new) in split.iter().zip(&current).zip(&proposed) {
        println!(
            "{:<18} {:>10.2} {:>10.2}",
            period.label,
            cur.as_ref().map_or(0.0, |o| o.ror),
            new.as_ref().map_or(0.0, |o| o.ror)
        );
    }

    print_param_block(&coin_data.name, &best.params);

    info!("Robust optimization completed successfully");
    Ok(())
}
