//! Robustness scoring across sub-periods
//!
//! The series is cut into N contiguous, equally sized sub-periods. A
//! candidate must trade at least `min_trades` times in every one of them or
//! it is dropped. Surviving candidates are scored on the spread of their
//! per-period returns:
//!
//! `0.4 * norm(mean) + 0.3 * norm(min) + 0.2 * (1 - norm(std)) + 0.1 * (N - losses) / N`
//!
//! where `norm` min-max scales across all surviving candidates of a stage.

use statrs::statistics::Statistics;
use std::ops::Range;
use tracing::info;

use crate::backtest::{BacktestSettings, Backtester};
use crate::optimizer::{normalize, StageEvaluator};
use crate::params::StrategyParams;
use crate::slices::{SliceArena, SliceError};
use crate::types::{Candle, Symbol, TradeOutcome};

/// Index ranges of `n` contiguous sub-periods; the last takes the remainder
///
/// Periods shorter than `min_rows` are discarded.
pub fn split_ranges(len: usize, n: usize, min_rows: usize) -> Vec<Range<usize>> {
    if n == 0 || len == 0 {
        return Vec::new();
    }
    let size = len / n;

    (0..n)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 < n { start + size } else { len };
            start..end
        })
        .filter(|r| r.len() >= min_rows && !r.is_empty())
        .collect()
}

/// One sub-period loaded for evaluation
#[derive(Debug, Clone)]
pub struct Period {
    /// `YYYY-MM~YYYY-MM`
    pub label: String,
    pub candles: Vec<Candle>,
}

fn period_label(candles: &[Candle]) -> String {
    match (candles.first(), candles.last()) {
        (Some(first), Some(last)) => format!(
            "{}~{}",
            first.datetime.format("%Y-%m"),
            last.datetime.format("%Y-%m")
        ),
        _ => String::from("empty"),
    }
}

/// Split `candles` into sub-periods, each written to and reloaded from the arena
pub fn split_periods(
    candles: &[Candle],
    n: usize,
    min_rows: usize,
    arena: &mut SliceArena,
) -> Result<Vec<Period>, SliceError> {
    let ranges = split_ranges(candles.len(), n, min_rows);
    let mut periods = Vec::with_capacity(ranges.len());

    for range in ranges {
        let slice = &candles[range];
        let label = period_label(slice);
        let loaded = arena.isolate(&format!("period_{}", label), slice)?;
        info!(period = %label, rows = loaded.len(), "Prepared sub-period");
        periods.push(Period {
            label,
            candles: loaded,
        });
    }

    Ok(periods)
}

/// Per-period results of one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct RobustStats {
    pub period_rors: Vec<f64>,
    pub period_trades: Vec<usize>,
    pub avg_ror: f64,
    pub min_ror: f64,
    /// Population standard deviation
    pub std_ror: f64,
    pub loss_count: usize,
}

impl RobustStats {
    /// `None` for an empty list
    pub fn from_rors(period_rors: Vec<f64>, period_trades: Vec<usize>) -> Option<Self> {
        if period_rors.is_empty() {
            return None;
        }
        let avg_ror = period_rors.iter().mean();
        let std_ror = period_rors.iter().population_std_dev();
        let min_ror = period_rors.iter().copied().fold(f64::INFINITY, f64::min);
        let loss_count = period_rors.iter().filter(|r| **r < 0.0).count();

        Some(RobustStats {
            period_rors,
            period_trades,
            avg_ror,
            min_ror,
            std_ror,
            loss_count,
        })
    }

    pub fn periods(&self) -> usize {
        self.period_rors.len()
    }
}

/// Robustness score of every candidate, normalised across the whole set
pub fn robust_scores(stats: &[RobustStats]) -> Vec<f64> {
    let avgs: Vec<f64> = stats.iter().map(|s| s.avg_ror).collect();
    let mins: Vec<f64> = stats.iter().map(|s| s.min_ror).collect();
    let stds: Vec<f64> = stats.iter().map(|s| s.std_ror).collect();

    stats
        .iter()
        .map(|s| {
            let n = s.periods().max(1) as f64;
            0.4 * normalize(s.avg_ror, &avgs)
                + 0.3 * normalize(s.min_ror, &mins)
                + 0.2 * (1.0 - normalize(s.std_ror, &stds))
                + 0.1 * ((n - s.loss_count as f64) / n)
        })
        .collect()
}

/// Evaluates a candidate independently in every sub-period
pub struct RobustEvaluator<'a> {
    symbol: Symbol,
    periods: &'a [Period],
    settings: BacktestSettings,
    min_trades: usize,
}

impl<'a> RobustEvaluator<'a> {
    pub fn new(
        symbol: Symbol,
        periods: &'a [Period],
        settings: BacktestSettings,
        min_trades: usize,
    ) -> Self {
        RobustEvaluator {
            symbol,
            periods,
            settings,
            min_trades,
        }
    }

    /// Outcome of `params` in each period, without disqualification
    pub fn per_period(&self, params: &StrategyParams) -> Vec<Option<TradeOutcome>> {
        let backtester =
            Backtester::new(self.symbol.clone(), params.clone(), self.settings.clone());
        self.periods
            .iter()
            .map(|p| backtester.outcome(&p.candles))
            .collect()
    }
}

impl StageEvaluator for RobustEvaluator<'_> {
    type Stats = RobustStats;

    fn evaluate(&self, params: &StrategyParams) -> Option<RobustStats> {
        let backtester =
            Backtester::new(self.symbol.clone(), params.clone(), self.settings.clone());

        let mut rors = Vec::with_capacity(self.periods.len());
        let mut trades = Vec::with_capacity(self.periods.len());
        for period in self.periods {
            let outcome = backtester
                .outcome(&period.candles)
                .filter(|o| o.trade_count >= self.min_trades)?;
            rors.push(outcome.ror);
            trades.push(outcome.trade_count);
        }

        RobustStats::from_rors(rors, trades)
    }

    fn score(&self, stats: &[RobustStats]) -> Vec<f64> {
        robust_scores(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_split_ranges_last_takes_remainder() {
        let ranges = split_ranges(1003, 5, 100);
        assert_eq!(ranges.len(), 5);
        assert_eq!(ranges[0], 0..200);
        assert_eq!(ranges[4], 800..1003);
    }

    #[test]
    fn test_split_ranges_drops_short_periods() {
        assert!(split_ranges(450, 5, 100).is_empty());
        assert_eq!(split_ranges(450, 4, 100).len(), 4);
        assert!(split_ranges(0, 4, 100).is_empty());
        assert!(split_ranges(500, 0, 100).is_empty());
    }

    #[test]
    fn test_stats() {
        let stats = RobustStats::from_rors(vec![10.0, -2.0, 4.0], vec![6, 7, 8]).unwrap();
        assert_relative_eq!(stats.avg_ror, 4.0);
        assert_relative_eq!(stats.min_ror, -2.0);
        assert_relative_eq!(stats.std_ror, (24.0f64).sqrt());
        assert_eq!(stats.loss_count, 1);
        assert!(RobustStats::from_rors(vec![], vec![]).is_none());
    }

    #[test]
    fn test_consistent_candidate_beats_one_losing_period() {
        let four_of_five =
            RobustStats::from_rors(vec![6.0, 6.0, 6.0, 6.0, -4.0], vec![5; 5]).unwrap();
        let five_of_five = RobustStats::from_rors(vec![4.0; 5], vec![5; 5]).unwrap();
        assert_relative_eq!(four_of_five.avg_ror, five_of_five.avg_ror);

        let scores = robust_scores(&[four_of_five, five_of_five]);
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn test_single_candidate_scores_midpoints() {
        let stats = RobustStats::from_rors(vec![1.0, 2.0, 3.0, 4.0], vec![5; 4]).unwrap();
        let scores = robust_scores(&[stats]);
        assert_relative_eq!(scores[0], 0.4 * 0.5 + 0.3 * 0.5 + 0.2 * 0.5 + 0.1);
    }
}
