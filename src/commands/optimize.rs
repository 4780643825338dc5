//! Optimize command: two-stage grid search with composite scoring

use anyhow::Result;
use coin_trader::optimizer::{two_stage, CompositeEvaluator, SearchOptions};
use coin_trader::params::format_params;
use coin_trader::backtest::Backtester;
use coin_trader::{Config, StrategyParams};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

use super::{load_coin, print_outcome, print_param_block, print_ranked, rule, settings};

pub fn run(
    config: Config,
    coin: String,
    top: usize,
    cash: Option<f64>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let coin_data = load_coin(&config, &coin, None)?;
    let settings = settings(&config, cash);
    let grid = config.grid();

    let entry_count = grid.entry_combinations().len();
    let exit_count = grid.exit_combinations().len();
    println!("\n{}", rule(70));
    println!("OPTIMIZATION: {}", coin_data.coin.symbol);
    println!("{}", rule(70));
    println!("  Candles:       {}", coin_data.candles.len());
    println!("  Stage 1:       {} entry combinations", entry_count);
    println!(
        "  Stage 2:       {} exit combinations x top {}",
        exit_count, config.search.top_k
    );
    println!("  Min trades:    {}", config.search.min_trades);
    println!("{}\n", rule(70));

    let evaluator = CompositeEvaluator::new(
        coin_data.coin.symbol(),
        &coin_data.candles,
        settings.clone(),
        config.search.min_trades,
    );
    let opts = SearchOptions {
        top_k: config.search.top_k,
        show_progress: true,
        cancel,
    };
    // Stage 1 always starts from defaults
    let report = two_stage(&evaluator, &StrategyParams::default(), &grid, &opts);

    if report.cancelled {
        println!("\nSearch interrupted; showing completed results.");
    }

    print_ranked("STAGE 1 (entry parameters)", &report.stage1, top);
    if report.stage2.is_empty() {
        println!("\nNo parameter set reached {} trades.", config.search.min_trades);
        info!("Optimization finished without viable results");
        return Ok(());
    }
    print_ranked("STAGE 2 (exit parameters)", &report.stage2, top);

    if let Some(best) = report.best() {
        println!("\nCurrent: {}", format_params(&coin_data.params));
        println!("Best:    {}", format_params(&best.params));
        print_outcome("\nBest result:", &best.stats);

        let current = Backtester::new(
            coin_data.coin.symbol(),
            coin_data.params.clone(),
            settings,
        )
        .outcome(&coin_data.candles);
        match current {
            Some(outcome) => print_outcome("\nCurrent parameters:", &outcome),
            None => println!("\nCurrent parameters: no trades"),
        }
        print_param_block(&coin_data.name, &best.params);
    }

    info!("Optimization completed successfully");
    Ok(())
}
