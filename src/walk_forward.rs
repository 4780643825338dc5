//! Walk-forward validation
//!
//! Builds train/test date windows over the data range, runs the two-stage
//! search on each train slice only, and replays the winner on the disjoint
//! test slice that follows it.
//!
//! - anchored: train always starts at the data start; each window extends
//!   the train end by one test length
//! - rolling: train start and end both slide by one test length, so the
//!   train length stays fixed
//!
//! `efficiency = test_ror / train_ror` is only defined for a positive train
//! ROR. The mean efficiency across windows drives the overfitting verdict.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{info, warn};

use crate::backtest::{BacktestSettings, Backtester};
use crate::config::SearchConfig;
use crate::data;
use crate::optimizer::{two_stage, CompositeEvaluator, ParamGrid, SearchOptions};
use crate::params::StrategyParams;
use crate::robust::{split_periods, RobustEvaluator};
use crate::slices::{SliceArena, SliceError};
use crate::types::{Candle, Symbol, TradeOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    #[default]
    Anchored,
    Rolling,
}

impl FromStr for WindowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anchored" => Ok(WindowMode::Anchored),
            "rolling" => Ok(WindowMode::Rolling),
            other => Err(format!("unknown mode '{}' (expected anchored or rolling)", other)),
        }
    }
}

impl std::fmt::Display for WindowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowMode::Anchored => write!(f, "anchored"),
            WindowMode::Rolling => write!(f, "rolling"),
        }
    }
}

/// Train range `[train_start, train_end)` followed by test range `[test_start, test_end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchWindow {
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
}

impl std::fmt::Display for SearchWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Train [{} ~ {}] -> Test [{} ~ {}]",
            self.train_start.format("%Y-%m"),
            self.train_end.format("%Y-%m"),
            self.test_start.format("%Y-%m"),
            self.test_end.format("%Y-%m"),
        )
    }
}

/// Build the window sequence for a data range
pub fn build_windows(
    data_start: DateTime<Utc>,
    data_end: DateTime<Utc>,
    train_years: u32,
    test_months: u32,
    mode: WindowMode,
) -> Vec<SearchWindow> {
    let mut windows = Vec::new();
    if test_months == 0 {
        return windows;
    }

    let train = Months::new(train_years * 12);
    let test = Months::new(test_months);
    let limit = data_end + Duration::days(1);

    match mode {
        WindowMode::Anchored => {
            let Some(mut train_end) = data_start.checked_add_months(train) else {
                return windows;
            };
            while let Some(test_end) = train_end.checked_add_months(test) {
                if test_end > limit {
                    break;
                }
                windows.push(SearchWindow {
                    train_start: data_start,
                    train_end,
                    test_start: train_end,
                    test_end,
                });
                train_end = test_end;
            }
        }
        WindowMode::Rolling => {
            let mut train_start = data_start;
            loop {
                let Some(train_end) = train_start.checked_add_months(train) else {
                    break;
                };
                if train_end >= data_end {
                    break;
                }
                let Some(test_end) = train_end.checked_add_months(test) else {
                    break;
                };
                windows.push(SearchWindow {
                    train_start,
                    train_end,
                    test_start: train_end,
                    test_end: test_end.min(limit),
                });
                match train_start.checked_add_months(test) {
                    Some(next) => train_start = next,
                    None => break,
                }
            }
        }
    }

    windows
}

/// `test / train` for a positive train ROR, otherwise not applicable
pub fn efficiency(train_ror: f64, test_ror: Option<f64>) -> Option<f64> {
    match test_ror {
        Some(test) if train_ror > 0.0 => Some(test / train_ror),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverfitRisk {
    Low,
    Moderate,
    High,
}

impl OverfitRisk {
    pub fn classify(mean_efficiency: f64) -> Self {
        if mean_efficiency >= 0.5 {
            OverfitRisk::Low
        } else if mean_efficiency >= 0.2 {
            OverfitRisk::Moderate
        } else {
            OverfitRisk::High
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            OverfitRisk::Low => "low overfitting risk: test keeps at least 50% of train performance",
            OverfitRisk::Moderate => "moderate overfitting risk: test is well below train",
            OverfitRisk::High => "high overfitting risk: strategy barely works out of sample",
        }
    }
}

/// Train-side figures of the selected parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    /// Whole-window ROR, or the mean sub-period ROR when robust scoring was used
    pub ror: f64,
    pub sharpe: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub win_rate: Option<f64>,
    pub trades: usize,
    /// Worst sub-period ROR (robust only)
    pub min_ror: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowResult {
    pub window: SearchWindow,
    pub robust: bool,
    pub best_params: StrategyParams,
    pub train: TrainSummary,
    /// `None` when the winner did not trade in the test window
    pub test: Option<TradeOutcome>,
    pub efficiency: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct WalkForwardSettings {
    pub mode: WindowMode,
    pub train_years: u32,
    pub test_months: u32,
    pub robust: bool,
    /// Sub-periods per train window when robust
    pub robust_periods: usize,
    pub backtest: BacktestSettings,
    pub search: SearchConfig,
}

impl Default for WalkForwardSettings {
    fn default() -> Self {
        WalkForwardSettings {
            mode: WindowMode::Anchored,
            train_years: 2,
            test_months: 12,
            robust: true,
            robust_periods: 4,
            backtest: BacktestSettings::default(),
            search: SearchConfig::default(),
        }
    }
}

fn classic_train(
    symbol: &Symbol,
    train: &[Candle],
    settings: &WalkForwardSettings,
    grid: &ParamGrid,
    opts: &SearchOptions,
) -> Option<(StrategyParams, TrainSummary)> {
    let evaluator = CompositeEvaluator::new(
        symbol.clone(),
        train,
        settings.backtest.clone(),
        settings.search.min_trades,
    );
    let report = two_stage(&evaluator, &StrategyParams::default(), grid, opts);
    let best = report.completed_best()?;
    let o = &best.stats;
    Some((
        best.params.clone(),
        TrainSummary {
            ror: o.ror,
            sharpe: Some(o.sharpe),
            max_drawdown: Some(o.max_drawdown),
            win_rate: Some(o.win_rate),
            trades: o.trade_count,
            min_ror: None,
        },
    ))
}

/// Optimise on the train slice of `window`, then replay the winner on its test slice
///
/// Returns `Ok(None)` when either slice is too small or no candidate survives.
/// An interrupted search also yields `Ok(None)`.
pub fn run_window(
    symbol: &Symbol,
    candles: &[Candle],
    window: &SearchWindow,
    settings: &WalkForwardSettings,
    grid: &ParamGrid,
    opts: &SearchOptions,
    arena: &mut SliceArena,
) -> Result<Option<WindowResult>, SliceError> {
    let train_slice = data::slice_by_date(candles, window.train_start, window.train_end);
    let test_slice = data::slice_by_date(candles, window.test_start, window.test_end);

    if train_slice.len() < settings.search.min_train_rows
        || test_slice.len() < settings.search.min_test_rows
    {
        info!(
            train_rows = train_slice.len(),
            test_rows = test_slice.len(),
            "Skipping window with too little data"
        );
        return Ok(None);
    }

    let label = window.train_end.format("%Y%m").to_string();
    let train = arena.isolate(&format!("train_{}", label), train_slice)?;
    let test = arena.isolate(&format!("test_{}", label), test_slice)?;

    let mut used_robust = false;
    let selected = if settings.robust {
        let periods = split_periods(
            &train,
            settings.robust_periods,
            settings.search.min_period_rows,
            arena,
        )?;
        if periods.len() < 2 {
            warn!(
                periods = periods.len(),
                "Train window too short for sub-periods, using plain scoring"
            );
            classic_train(symbol, &train, settings, grid, opts)
        } else {
            used_robust = true;
            let evaluator = RobustEvaluator::new(
                symbol.clone(),
                &periods,
                settings.backtest.clone(),
                settings.search.walk_forward_min_trades,
            );
            let report = two_stage(&evaluator, &StrategyParams::default(), grid, opts);
            report.completed_best().map(|best| {
                let s = &best.stats;
                (
                    best.params.clone(),
                    TrainSummary {
                        ror: s.avg_ror,
                        sharpe: None,
                        max_drawdown: None,
                        win_rate: None,
                        trades: s.period_trades.iter().sum(),
                        min_ror: Some(s.min_ror),
                    },
                )
            })
        }
    } else {
        classic_train(symbol, &train, settings, grid, opts)
    };

    if opts.is_cancelled() {
        info!("Search interrupted, discarding unfinished window");
        return Ok(None);
    }

    let Some((best_params, train_summary)) = selected else {
        info!("No viable parameters in train window");
        return Ok(None);
    };

    let test_outcome = Backtester::new(
        symbol.clone(),
        best_params.clone(),
        settings.backtest.clone(),
    )
    .outcome(&test);

    let efficiency = efficiency(train_summary.ror, test_outcome.as_ref().map(|o| o.ror));

    Ok(Some(WindowResult {
        window: *window,
        robust: used_robust,
        best_params,
        train: train_summary,
        test: test_outcome,
        efficiency,
    }))
}

/// Aggregate view over all evaluated windows
#[derive(Debug, Clone)]
pub struct WalkForwardSummary {
    pub windows: Vec<WindowResult>,
    pub mean_efficiency: Option<f64>,
    pub mean_test_ror: Option<f64>,
    /// Windows with a positive test ROR
    pub positive_windows: usize,
    /// Number of windows whose test run produced a result
    pub tested_windows: usize,
    pub risk: Option<OverfitRisk>,
    /// Winning EMA periods identical in every window
    pub ema_stable: bool,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn summarize(windows: Vec<WindowResult>) -> WalkForwardSummary {
    let efficiencies: Vec<f64> = windows.iter().filter_map(|w| w.efficiency).collect();
    let test_rors: Vec<f64> = windows
        .iter()
        .filter_map(|w| w.test.as_ref().map(|t| t.ror))
        .collect();

    let mean_efficiency = mean(&efficiencies);
    let ema_stable = windows
        .iter()
        .map(|w| (w.best_params.entry.ema_short, w.best_params.entry.ema_long))
        .collect::<std::collections::BTreeSet<_>>()
        .len()
        <= 1;

    WalkForwardSummary {
        mean_efficiency,
        mean_test_ror: mean(&test_rors),
        positive_windows: test_rors.iter().filter(|r| **r > 0.0).count(),
        tested_windows: test_rors.len(),
        risk: mean_efficiency.map(OverfitRisk::classify),
        ema_stable,
        windows,
    }
}

/// Run every window of the data range
///
/// Stops early, keeping finished windows, once `opts.cancel` is set.
pub fn walk_forward(
    symbol: &Symbol,
    candles: &[Candle],
    settings: &WalkForwardSettings,
    grid: &ParamGrid,
    opts: &SearchOptions,
) -> Result<WalkForwardSummary, SliceError> {
    let Some((start, end)) = data::date_range(candles) else {
        return Ok(summarize(Vec::new()));
    };
    let windows = build_windows(
        start,
        end,
        settings.train_years,
        settings.test_months,
        settings.mode,
    );
    info!(
        %symbol,
        mode = %settings.mode,
        windows = windows.len(),
        robust = settings.robust,
        "Starting walk-forward"
    );

    let mut arena = SliceArena::new()?;
    let mut results = Vec::new();

    for (i, window) in windows.iter().enumerate() {
        if opts.is_cancelled() {
            warn!("Walk-forward interrupted after {} windows", i);
            break;
        }
        info!("Window {}/{}: {}", i + 1, windows.len(), window);
        if let Some(result) = run_window(symbol, candles, window, settings, grid, opts, &mut arena)? {
            info!(
                train_ror = result.train.ror,
                test_ror = ?result.test.as_ref().map(|t| t.ror),
                efficiency = ?result.efficiency,
                "Window finished"
            );
            results.push(result);
        }
    }

    Ok(summarize(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_anchored_windows() {
        let windows = build_windows(date(2021, 1, 1), date(2025, 12, 31), 2, 12, WindowMode::Anchored);
        assert_eq!(windows.len(), 3);
        for w in &windows {
            assert_eq!(w.train_start, date(2021, 1, 1));
            assert_eq!(w.test_start, w.train_end);
        }
        assert_eq!(windows[0].train_end, date(2023, 1, 1));
        assert_eq!(windows[2].test_end, date(2026, 1, 1));

        // Test ranges are contiguous and never overlap
        for pair in windows.windows(2) {
            assert_eq!(pair[0].test_end, pair[1].test_start);
        }
    }

    #[test]
    fn test_rolling_windows_keep_train_length() {
        let windows = build_windows(date(2021, 1, 1), date(2025, 6, 30), 2, 6, WindowMode::Rolling);
        assert!(windows.len() >= 3);
        for w in &windows {
            assert_eq!(w.train_start.checked_add_months(Months::new(24)), Some(w.train_end));
            assert!(w.test_end <= date(2025, 7, 1));
        }
        for pair in windows.windows(2) {
            assert_eq!(pair[0].test_end, pair[1].test_start);
        }
    }

    #[test]
    fn test_no_windows_when_range_too_short() {
        let windows = build_windows(date(2024, 1, 1), date(2024, 12, 31), 2, 12, WindowMode::Anchored);
        assert!(windows.is_empty());
    }

    #[test]
    fn test_efficiency_undefined_for_non_positive_train() {
        assert_eq!(efficiency(10.0, Some(5.0)), Some(0.5));
        assert_eq!(efficiency(0.0, Some(5.0)), None);
        assert_eq!(efficiency(-3.0, Some(5.0)), None);
        assert_eq!(efficiency(10.0, None), None);
    }

    #[test]
    fn test_risk_classification() {
        assert_eq!(OverfitRisk::classify(0.5), OverfitRisk::Low);
        assert_eq!(OverfitRisk::classify(0.49), OverfitRisk::Moderate);
        assert_eq!(OverfitRisk::classify(0.2), OverfitRisk::Moderate);
        assert_eq!(OverfitRisk::classify(0.1), OverfitRisk::High);
        assert_eq!(OverfitRisk::classify(-1.0), OverfitRisk::High);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("rolling".parse::<WindowMode>(), Ok(WindowMode::Rolling));
        assert_eq!("Anchored".parse::<WindowMode>(), Ok(WindowMode::Anchored));
        assert!("expanding".parse::<WindowMode>().is_err());
    }
}
