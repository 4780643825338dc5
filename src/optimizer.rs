//! Two-stage grid search
//!
//! Stage 1 enumerates entry-parameter combinations on top of the default exit
//! parameters. The top-K entry sets then each get the full exit-parameter grid
//! in stage 2. Every stage runs its combinations in parallel on the rayon pool
//! and ranks only after all of them finished, so scores are a function of the
//! complete candidate set.
//!
//! What "evaluate" and "score" mean is supplied by a [`StageEvaluator`]: the
//! plain [`CompositeEvaluator`] runs one backtest per combination, the robust
//! evaluator in [`crate::robust`] runs one per sub-period.

use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backtest::{BacktestSettings, Backtester};
use crate::params::StrategyParams;
use crate::types::{Candle, Symbol, TradeOutcome};

/// One point of a grid: knob name to value
pub type Combination = BTreeMap<String, f64>;

/// Value lists for the entry (stage 1) and exit (stage 2) knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGrid {
    pub entry: BTreeMap<String, Vec<f64>>,
    pub exit: BTreeMap<String, Vec<f64>>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        let entry = [
            ("ema_short", vec![5.0, 10.0, 15.0, 20.0]),
            ("ema_long", vec![20.0, 30.0, 50.0, 60.0]),
            ("rsi_overbought", vec![70.0, 80.0]),
            ("rsi_oversold", vec![20.0, 30.0]),
            ("adx_threshold", vec![15.0, 20.0, 25.0, 30.0]),
            ("atr_multiplier", vec![1.5, 2.0, 3.0]),
        ];
        let exit = [
            ("target_ror", vec![5.0, 7.0, 10.0, 15.0]),
            ("trailing_ratio", vec![0.4, 0.5, 0.6, 0.7]),
            ("tight_trailing_ratio", vec![0.65, 0.75, 0.85]),
        ];
        ParamGrid {
            entry: entry.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            exit: exit.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }
}

impl ParamGrid {
    pub fn entry_combinations(&self) -> Vec<Combination> {
        combinations(&self.entry)
    }

    pub fn exit_combinations(&self) -> Vec<Combination> {
        combinations(&self.exit)
    }
}

/// Cartesian product of a grid, without combinations where `ema_short >= ema_long`
pub fn combinations(grid: &BTreeMap<String, Vec<f64>>) -> Vec<Combination> {
    if grid.is_empty() {
        return vec![Combination::new()];
    }

    let keys: Vec<&String> = grid.keys().collect();
    grid.values()
        .map(|values| values.iter().copied())
        .multi_cartesian_product()
        .map(|values| {
            keys.iter()
                .map(|k| k.to_string())
                .zip(values)
                .collect::<Combination>()
        })
        .filter(|combo| match (combo.get("ema_short"), combo.get("ema_long")) {
            (Some(short), Some(long)) => short < long,
            _ => true,
        })
        .collect()
}

/// Min-max scale `value` into [0, 1] relative to `values`; 0.5 when they are all equal
pub fn normalize(value: f64, values: &[f64]) -> f64 {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if values.is_empty() || max <= min {
        return 0.5;
    }
    (value - min) / (max - min)
}

/// `0.4 * max(0, sharpe) + 0.3 * norm(ror) + 0.3 * norm(100 - mdd)` over one candidate set
pub fn composite_scores(outcomes: &[TradeOutcome]) -> Vec<f64> {
    let rors: Vec<f64> = outcomes.iter().map(|o| o.ror).collect();
    let headroom: Vec<f64> = outcomes.iter().map(|o| 100.0 - o.max_drawdown).collect();

    outcomes
        .iter()
        .map(|o| {
            0.4 * o.sharpe.max(0.0)
                + 0.3 * normalize(o.ror, &rors)
                + 0.3 * normalize(100.0 - o.max_drawdown, &headroom)
        })
        .collect()
}

/// Evaluation and scoring policy of a search stage
pub trait StageEvaluator: Sync {
    type Stats: Send + Sync + Clone + std::fmt::Debug;

    /// Evaluate one parameter set; `None` drops it from ranking
    fn evaluate(&self, params: &StrategyParams) -> Option<Self::Stats>;

    /// Score every candidate of one stage; result is index-aligned with `stats`
    fn score(&self, stats: &[Self::Stats]) -> Vec<f64>;
}

/// Plain scoring: one backtest over the whole series with a trade-count floor
pub struct CompositeEvaluator<'a> {
    symbol: Symbol,
    candles: &'a [Candle],
    settings: BacktestSettings,
    min_trades: usize,
}

impl<'a> CompositeEvaluator<'a> {
    pub fn new(
        symbol: Symbol,
        candles: &'a [Candle],
        settings: BacktestSettings,
        min_trades: usize,
    ) -> Self {
        CompositeEvaluator {
            symbol,
            candles,
            settings,
            min_trades,
        }
    }
}

impl StageEvaluator for CompositeEvaluator<'_> {
    type Stats = TradeOutcome;

    fn evaluate(&self, params: &StrategyParams) -> Option<TradeOutcome> {
        Backtester::new(self.symbol.clone(), params.clone(), self.settings.clone())
            .outcome(self.candles)
            .filter(|o| o.trade_count >= self.min_trades)
    }

    fn score(&self, stats: &[TradeOutcome]) -> Vec<f64> {
        composite_scores(stats)
    }
}

/// Ranked search result
#[derive(Debug, Clone)]
pub struct Candidate<S> {
    pub params: StrategyParams,
    pub stats: S,
    pub score: f64,
}

/// Search knobs shared by every command
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub show_progress: bool,
    /// Set by an interrupt handler; pending combinations are skipped
    pub cancel: Arc<AtomicBool>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            top_k: 3,
            show_progress: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl SearchOptions {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct SearchReport<S> {
    pub stage1: Vec<Candidate<S>>,
    pub stage2: Vec<Candidate<S>>,
    pub cancelled: bool,
}

impl<S> SearchReport<S> {
    /// Best full parameter set
    pub fn best(&self) -> Option<&Candidate<S>> {
        self.stage2.first()
    }

    /// Best full parameter set of a search that ran to completion
    ///
    /// An interrupted search ranks only the candidates finished so far.
    pub fn completed_best(&self) -> Option<&Candidate<S>> {
        if self.cancelled {
            None
        } else {
            self.best()
        }
    }
}

fn progress_bar(len: usize, label: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let template = format!(
        "{} {{percent:>3}}%|{{bar:40}}| {{pos}}/{{len}} [{{elapsed}}<{{eta}}, {{per_sec:.2}}] ✓ {{msg}}",
        label
    );
    match ProgressStyle::default_bar().template(&template) {
        Ok(style) => pb.set_style(style.progress_chars("█░ ")),
        Err(e) => warn!("Invalid progress template: {}", e),
    }
    pb
}

/// Evaluate parameter sets in parallel, dropping non-viable ones
pub fn evaluate_all<E: StageEvaluator>(
    evaluator: &E,
    candidates: Vec<StrategyParams>,
    label: &str,
    opts: &SearchOptions,
) -> Vec<(StrategyParams, E::Stats)> {
    let pb = progress_bar(candidates.len(), label, opts.show_progress);
    let valid = AtomicUsize::new(0);

    let results: Vec<(StrategyParams, E::Stats)> = candidates
        .into_par_iter()
        .filter_map(|params| {
            if opts.is_cancelled() {
                return None;
            }
            let stats = evaluator.evaluate(&params);
            pb.inc(1);
            stats.map(|s| {
                let count = valid.fetch_add(1, Ordering::Relaxed) + 1;
                pb.set_message(format!("{} valid", count));
                (params, s)
            })
        })
        .collect();

    pb.finish_with_message(format!("{} valid", results.len()));
    info!(stage = label, valid = results.len(), "Stage evaluated");
    results
}

fn ranking_key(params: &StrategyParams) -> Vec<OrderedFloat<f64>> {
    params.to_map().into_values().map(OrderedFloat).collect()
}

/// Score a complete stage and sort best first
///
/// Ties on score fall back to parameter order so the ranking does not depend
/// on evaluation order.
pub fn rank<E: StageEvaluator>(
    evaluator: &E,
    evaluated: Vec<(StrategyParams, E::Stats)>,
) -> Vec<Candidate<E::Stats>> {
    let stats: Vec<E::Stats> = evaluated.iter().map(|(_, s)| s.clone()).collect();
    let scores = evaluator.score(&stats);

    let mut ranked: Vec<Candidate<E::Stats>> = evaluated
        .into_iter()
        .zip(scores)
        .map(|((params, stats), score)| Candidate {
            params,
            stats,
            score,
        })
        .collect();

    ranked.sort_by(|a, b| {
        OrderedFloat(b.score)
            .cmp(&OrderedFloat(a.score))
            .then_with(|| ranking_key(&a.params).cmp(&ranking_key(&b.params)))
    });
    ranked
}

fn apply(base: &StrategyParams, combo: &Combination) -> Option<StrategyParams> {
    let mut params = base.clone();
    for (name, value) in combo {
        if let Err(e) = params.set(name, *value) {
            warn!("Skipping combination {:?}: {}", combo, e);
            return None;
        }
    }
    match params.validate() {
        Ok(()) => Some(params),
        Err(e) => {
            debug!("Skipping combination {:?}: {}", combo, e);
            None
        }
    }
}

/// Run both stages and return the two rankings
pub fn two_stage<E: StageEvaluator>(
    evaluator: &E,
    base: &StrategyParams,
    grid: &ParamGrid,
    opts: &SearchOptions,
) -> SearchReport<E::Stats> {
    let entry_combos = grid.entry_combinations();
    let exit_combos = grid.exit_combinations();
    info!(
        stage1 = entry_combos.len(),
        stage2 = exit_combos.len(),
        top_k = opts.top_k,
        "Starting two-stage search"
    );

    let stage1_params: Vec<StrategyParams> =
        entry_combos.iter().filter_map(|c| apply(base, c)).collect();
    let stage1 = rank(evaluator, evaluate_all(evaluator, stage1_params, "S1", opts));

    if opts.is_cancelled() || stage1.is_empty() {
        if stage1.is_empty() {
            info!("Stage 1 produced no viable combinations");
        }
        return SearchReport {
            stage1,
            stage2: Vec::new(),
            cancelled: opts.is_cancelled(),
        };
    }

    let stage2_params: Vec<StrategyParams> = stage1
        .iter()
        .take(opts.top_k)
        .flat_map(|top| exit_combos.iter().filter_map(|c| apply(&top.params, c)))
        .collect();
    let stage2 = rank(evaluator, evaluate_all(evaluator, stage2_params, "S2", opts));

    SearchReport {
        stage1,
        stage2,
        cancelled: opts.is_cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn outcome(ror: f64, sharpe: f64, mdd: f64) -> TradeOutcome {
        TradeOutcome {
            ror,
            sharpe,
            max_drawdown: mdd,
            trade_count: 40,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_stage1_never_has_short_above_long() {
        let combos = ParamGrid::default().entry_combinations();
        assert!(!combos.is_empty());
        for combo in &combos {
            assert!(combo["ema_short"] < combo["ema_long"]);
        }
        // 15 valid EMA pairs out of 16, times 2 * 2 * 4 * 3
        assert_eq!(combos.len(), 15 * 48);
    }

    #[test]
    fn test_exit_grid_size() {
        assert_eq!(ParamGrid::default().exit_combinations().len(), 48);
    }

    #[test]
    fn test_empty_grid_yields_single_base_combination() {
        assert_eq!(combinations(&BTreeMap::new()), vec![Combination::new()]);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(3.0, &[3.0]), 0.5);
        assert_eq!(normalize(1.0, &[1.0, 1.0, 1.0]), 0.5);
        assert_relative_eq!(normalize(5.0, &[0.0, 5.0, 10.0]), 0.5);
        assert_relative_eq!(normalize(10.0, &[0.0, 5.0, 10.0]), 1.0);
        assert_relative_eq!(normalize(0.0, &[0.0, 5.0, 10.0]), 0.0);
    }

    #[test]
    fn test_composite_score() {
        let outcomes = vec![outcome(10.0, 1.0, 10.0), outcome(20.0, -0.5, 20.0)];
        let scores = composite_scores(&outcomes);
        assert_relative_eq!(scores[0], 0.4 * 1.0 + 0.0 + 0.3 * 1.0);
        assert_relative_eq!(scores[1], 0.0 + 0.3 * 1.0 + 0.0);
    }

    #[test]
    fn test_composite_score_is_order_invariant() {
        let a = outcome(10.0, 1.2, 12.0);
        let b = outcome(-3.0, 0.1, 30.0);
        let c = outcome(25.0, 0.8, 18.0);

        let forward = composite_scores(&[a.clone(), b.clone(), c.clone()]);
        let reversed = composite_scores(&[c, b, a]);
        assert_relative_eq!(forward[0], reversed[2]);
        assert_relative_eq!(forward[1], reversed[1]);
        assert_relative_eq!(forward[2], reversed[0]);
    }

    struct FakeEvaluator;

    impl StageEvaluator for FakeEvaluator {
        type Stats = f64;

        fn evaluate(&self, params: &StrategyParams) -> Option<f64> {
            // Prefers a short fast EMA and a high target
            Some(params.exit.target_ror - params.entry.ema_short as f64)
        }

        fn score(&self, stats: &[f64]) -> Vec<f64> {
            stats.iter().map(|s| normalize(*s, stats)).collect()
        }
    }

    #[test]
    fn test_two_stage_carries_top_entries_into_stage2() {
        let mut grid = ParamGrid::default();
        grid.entry.retain(|k, _| k == "ema_short" || k == "ema_long");
        let opts = SearchOptions::default();

        let report = two_stage(&FakeEvaluator, &StrategyParams::default(), &grid, &opts);
        assert!(!report.cancelled);
        assert_eq!(report.stage1.len(), 15);
        // Top 3 entry sets times 48 exit combinations
        assert_eq!(report.stage2.len(), 3 * 48);

        let best = report.best().unwrap();
        assert_eq!(best.params.entry.ema_short, 5);
        assert_eq!(best.params.exit.target_ror, 15.0);
        for candidate in &report.stage2 {
            assert_eq!(candidate.params.entry.ema_short, 5);
        }
    }

    /// Raises the cancel flag on the first exit-stage evaluation
    struct InterruptInStage2 {
        cancel: Arc<AtomicBool>,
        calls: AtomicUsize,
        stage1_len: usize,
    }

    impl StageEvaluator for InterruptInStage2 {
        type Stats = f64;

        fn evaluate(&self, params: &StrategyParams) -> Option<f64> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.stage1_len {
                self.cancel.store(true, Ordering::SeqCst);
            }
            FakeEvaluator.evaluate(params)
        }

        fn score(&self, stats: &[f64]) -> Vec<f64> {
            FakeEvaluator.score(stats)
        }
    }

    #[test]
    fn test_interrupted_stage2_has_no_completed_winner() {
        let mut grid = ParamGrid::default();
        grid.entry.retain(|k, _| k == "ema_short" || k == "ema_long");
        let opts = SearchOptions::default();
        let evaluator = InterruptInStage2 {
            cancel: opts.cancel.clone(),
            calls: AtomicUsize::new(0),
            stage1_len: 15,
        };

        let report = two_stage(&evaluator, &StrategyParams::default(), &grid, &opts);
        assert!(report.cancelled);
        assert_eq!(report.stage1.len(), 15);
        assert!(!report.stage2.is_empty());
        assert!(report.stage2.len() < 3 * 48);
        // A partial ranking still has a leader, but it is not a search result
        assert!(report.best().is_some());
        assert!(report.completed_best().is_none());
    }

    #[test]
    fn test_completed_search_reports_winner() {
        let mut grid = ParamGrid::default();
        grid.entry.retain(|k, _| k == "ema_short" || k == "ema_long");
        let report = two_stage(
            &FakeEvaluator,
            &StrategyParams::default(),
            &grid,
            &SearchOptions::default(),
        );
        assert_eq!(
            report.completed_best().map(|c| c.params.clone()),
            report.best().map(|c| c.params.clone())
        );
        assert!(report.completed_best().is_some());
    }

    #[test]
    fn test_cancelled_search_skips_stage2() {
        let opts = SearchOptions::default();
        opts.cancel.store(true, Ordering::Relaxed);
        let report = two_stage(
            &FakeEvaluator,
            &StrategyParams::default(),
            &ParamGrid::default(),
            &opts,
        );
        assert!(report.cancelled);
        assert!(report.stage1.is_empty());
        assert!(report.stage2.is_empty());
    }
}
