//! Single-run backtester
//!
//! Replays one candle series against one parameter set. While flat, the
//! entry evaluator runs on every bar; while in a position, the exit state
//! machine does. Orders fill at the bar close with a per-side commission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::exit::{ExitDecision, ExitReason, ExitState, ExitTick};
use crate::params::StrategyParams;
use crate::signal::IndicatorSeries;
use crate::types::{Candle, Side, Symbol, Trade, TradeOutcome};

/// Account and reporting settings for a backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestSettings {
    pub initial_cash: f64,
    /// Commission per side as a fraction of notional
    pub commission: f64,
    /// Fraction of cash risked per trade
    pub risk_percent: f64,
    /// Bars per year, used to annualise the Sharpe ratio
    pub periods_per_year: f64,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        BacktestSettings {
            initial_cash: 100_000.0,
            commission: 0.0005,
            risk_percent: 0.02,
            // 4h bars
            periods_per_year: 2190.0,
        }
    }
}

#[derive(Debug, Clone)]
struct OpenPosition {
    side: Side,
    entry_price: f64,
    quantity: f64,
    entry_index: usize,
    entry_time: DateTime<Utc>,
    entry_commission: f64,
    exit: ExitState,
}

impl OpenPosition {
    fn unrealized(&self, price: f64) -> f64 {
        self.side.direction() * (price - self.entry_price) * self.quantity
    }
}

#[derive(Debug, Default)]
pub struct BacktestResult {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    /// `None` when no trade was closed
    pub outcome: Option<TradeOutcome>,
}

/// Backtest engine
pub struct Backtester {
    settings: BacktestSettings,
    params: StrategyParams,
    symbol: Symbol,
}

impl Backtester {
    pub fn new(symbol: Symbol, params: StrategyParams, settings: BacktestSettings) -> Self {
        Backtester {
            settings,
            params,
            symbol,
        }
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    /// Run and keep only the summary statistics
    pub fn outcome(&self, candles: &[Candle]) -> Option<TradeOutcome> {
        self.run(candles).outcome
    }

    pub fn run(&self, candles: &[Candle]) -> BacktestResult {
        let entry = &self.params.entry;
        let exit = &self.params.exit;
        let series = IndicatorSeries::compute(candles, entry);

        let mut cash = self.settings.initial_cash;
        let mut position: Option<OpenPosition> = None;
        let mut trades = Vec::new();
        let mut equity_curve = Vec::with_capacity(candles.len());

        for (i, candle) in candles.iter().enumerate() {
            let price = candle.close;

            if let Some(pos) = position.as_mut() {
                let tick = ExitTick {
                    ror: pos.side.ror(pos.entry_price, price),
                    atr_ratio: series.atr_at(i).map(|atr| candle.atr_ratio(atr)),
                    elapsed_bars: (i - pos.entry_index) as f64,
                };
                if let ExitDecision::Close(reason) = pos.exit.tick(tick, exit) {
                    let trade = self.close(pos, price, candle.datetime, reason);
                    cash += trade.pnl - (trade.commission - pos.entry_commission);
                    trades.push(trade);
                    position = None;
                }
            } else {
                let decision = series.evaluate_at(i, entry);
                if let Some(side) = decision.signal.side() {
                    let risk_per_unit = decision.atr * entry.atr_multiplier;
                    if risk_per_unit > 0.0 {
                        let quantity = cash * self.settings.risk_percent / risk_per_unit;
                        if quantity > 0.0 {
                            let entry_commission = quantity * price * self.settings.commission;
                            cash -= entry_commission;
                            debug!(
                                symbol = %self.symbol,
                                %side,
                                price,
                                quantity,
                                target = decision.target_ror,
                                "Backtest entry"
                            );
                            position = Some(OpenPosition {
                                side,
                                entry_price: price,
                                quantity,
                                entry_index: i,
                                entry_time: candle.datetime,
                                entry_commission,
                                exit: ExitState::open(
                                    decision.target_ror,
                                    decision.atr_ratio,
                                    candle.datetime,
                                    exit,
                                ),
                            });
                        }
                    }
                }
            }

            let equity = cash + position.as_ref().map_or(0.0, |p| p.unrealized(price));
            equity_curve.push((candle.datetime, equity));
        }

        // Close any remaining position on the last bar
        if let (Some(pos), Some(last)) = (position.take(), candles.last()) {
            let trade = self.close(&pos, last.close, last.datetime, ExitReason::EndOfData);
            cash += trade.pnl - (trade.commission - pos.entry_commission);
            trades.push(trade);
            if let Some(point) = equity_curve.last_mut() {
                point.1 = cash;
            }
        }

        let outcome = self.calculate_outcome(&trades, &equity_curve);
        BacktestResult {
            trades,
            equity_curve,
            outcome,
        }
    }

    fn close(
        &self,
        pos: &OpenPosition,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Trade {
        let pnl = pos.unrealized(exit_price);
        let commission =
            pos.entry_commission + pos.quantity * exit_price * self.settings.commission;

        Trade {
            symbol: self.symbol.clone(),
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            entry_time: pos.entry_time,
            exit_time,
            pnl,
            commission,
            net_pnl: pnl - commission,
            exit_reason: reason.to_string(),
        }
    }

    fn calculate_outcome(
        &self,
        trades: &[Trade],
        equity_curve: &[(DateTime<Utc>, f64)],
    ) -> Option<TradeOutcome> {
        if trades.is_empty() {
            return None;
        }

        let initial = self.settings.initial_cash;
        let final_equity = equity_curve.last().map_or(initial, |(_, e)| *e);
        let ror = (final_equity - initial) / initial * 100.0;

        let wins: Vec<f64> = trades.iter().map(|t| t.net_pnl).filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = trades.iter().map(|t| t.net_pnl).filter(|p| *p <= 0.0).collect();

        let win_rate = wins.len() as f64 / trades.len() as f64 * 100.0;
        let avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };
        let pl_ratio = if avg_loss != 0.0 {
            (avg_win / avg_loss).abs()
        } else {
            0.0
        };

        Some(TradeOutcome {
            ror,
            sharpe: sharpe_ratio(equity_curve, self.settings.periods_per_year),
            max_drawdown: max_drawdown(equity_curve, initial),
            win_rate,
            trade_count: trades.len(),
            pnl: final_equity - initial,
            won: wins.len(),
            lost: losses.len(),
            pl_ratio,
            final_equity,
        })
    }
}

/// Peak-to-trough drawdown of the equity curve, in percent
pub fn max_drawdown(equity_curve: &[(DateTime<Utc>, f64)], initial: f64) -> f64 {
    let mut peak = initial;
    let mut max_dd = 0.0;

    for (_, equity) in equity_curve {
        if *equity > peak {
            peak = *equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd * 100.0
}

/// Annualised Sharpe ratio of per-bar equity returns (zero risk-free rate)
pub fn sharpe_ratio(equity_curve: &[(DateTime<Utc>, f64)], periods_per_year: f64) -> f64 {
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter(|w| w[0].1 != 0.0)
        .map(|w| (w[1].1 - w[0].1) / w[0].1)
        .collect();

    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let std_dev = variance.sqrt();

    if std_dev > 0.0 {
        mean / std_dev * periods_per_year.sqrt()
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                Candle::new_unchecked(
                    start + Duration::hours(4 * i as i64),
                    c,
                    c * 1.01,
                    c * 0.99,
                    c,
                    1000.0,
                )
            })
            .collect()
    }

    fn backtester() -> Backtester {
        Backtester::new(
            Symbol::new("TEST"),
            StrategyParams::default(),
            BacktestSettings::default(),
        )
    }

    #[test]
    fn test_flat_series_has_no_result() {
        let candles = candles_from(&vec![100.0; 300]);
        let result = backtester().run(&candles);
        assert!(result.trades.is_empty());
        assert!(result.outcome.is_none());
        assert_eq!(result.equity_curve.len(), 300);
    }

    #[test]
    fn test_uptrend_trades_long_and_profits() {
        let closes: Vec<f64> = (0..300).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let result = backtester().run(&candles_from(&closes));
        let outcome = result.outcome.expect("uptrend should trade");
        assert!(outcome.trade_count >= 1);
        assert!(result.trades.iter().all(|t| t.side == Side::Long));
        assert!(outcome.ror > 0.0);
        assert_eq!(outcome.won + outcome.lost, outcome.trade_count);
    }

    #[test]
    fn test_open_position_closed_at_end() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let result = backtester().run(&candles_from(&closes));
        let last = result.trades.last().expect("a trade");
        assert_eq!(last.exit_reason, "end of data");
        assert_relative_eq!(result.outcome.unwrap().final_equity, result.equity_curve.last().unwrap().1);
    }

    #[test]
    fn test_max_drawdown() {
        let t = Utc::now();
        let curve = vec![(t, 100.0), (t, 120.0), (t, 90.0), (t, 130.0)];
        assert_relative_eq!(max_drawdown(&curve, 100.0), 25.0);
    }

    #[test]
    fn test_sharpe_of_constant_curve_is_zero() {
        let t = Utc::now();
        let curve = vec![(t, 100.0); 10];
        assert_eq!(sharpe_ratio(&curve, 2190.0), 0.0);
    }
}
