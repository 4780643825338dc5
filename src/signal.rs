//! Entry signal evaluation
//!
//! The decision itself is a pure function of an [`IndicatorSnapshot`]. The
//! backtester precomputes an [`IndicatorSeries`] once per run and reads a
//! snapshot per bar; the live path computes one snapshot from the latest
//! candle window. Both therefore apply exactly the same rules.

use crate::indicators;
use crate::params::EntryParams;
use crate::types::{Candle, Signal};

/// Minimum number of candles before any signal can fire
pub const MIN_HISTORY: usize = 50;

const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;

/// Indicator readings at one bar
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub ema_short: f64,
    pub ema_long: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub atr: f64,
    /// Most recent ADX readings, oldest first, current last
    pub adx_recent: Vec<f64>,
}

impl IndicatorSnapshot {
    pub fn adx(&self) -> f64 {
        self.adx_recent.last().copied().unwrap_or(0.0)
    }

    /// ATR as a fraction of the close
    pub fn atr_ratio(&self) -> f64 {
        if self.close > 0.0 {
            self.atr / self.close
        } else {
            0.0
        }
    }
}

/// Result of one entry evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryDecision {
    pub signal: Signal,
    /// Proposed target ROR in percent, `|ATR / close| * 100`
    pub target_ror: f64,
    pub atr: f64,
    pub atr_ratio: f64,
}

impl EntryDecision {
    pub fn flat() -> Self {
        EntryDecision {
            signal: Signal::Flat,
            target_ror: 0.0,
            atr: 0.0,
            atr_ratio: 0.0,
        }
    }
}

/// Precomputed indicator columns for a whole candle series
#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    close: Vec<f64>,
    ema_short: Vec<Option<f64>>,
    ema_long: Vec<Option<f64>>,
    rsi: Vec<Option<f64>>,
    macd: Vec<Option<f64>>,
    macd_signal: Vec<Option<f64>>,
    atr: Vec<Option<f64>>,
    adx: Vec<f64>,
    breakout_run: usize,
}

impl IndicatorSeries {
    pub fn compute(candles: &[Candle], params: &EntryParams) -> Self {
        let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let close: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let (macd, macd_signal) = indicators::macd(&close, MACD_FAST, MACD_SLOW, MACD_SIGNAL);

        IndicatorSeries {
            ema_short: indicators::ema(&close, params.ema_short),
            ema_long: indicators::ema(&close, params.ema_long),
            rsi: indicators::rsi(&close, params.rsi_period),
            macd,
            macd_signal,
            atr: indicators::atr(&high, &low, &close, params.atr_period),
            adx: indicators::adx_series(&high, &low, &close, params.adx_period),
            breakout_run: params.breakout_run.max(1),
            close,
        }
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    /// ATR at bar `i`, if enough history exists
    pub fn atr_at(&self, i: usize) -> Option<f64> {
        self.atr.get(i).copied().flatten()
    }

    /// Readings at bar `i`, or `None` while any required indicator is still warming up
    pub fn snapshot(&self, i: usize) -> Option<IndicatorSnapshot> {
        if i >= self.close.len() {
            return None;
        }

        let start = (i + 1).saturating_sub(self.breakout_run);
        Some(IndicatorSnapshot {
            close: self.close[i],
            ema_short: self.ema_short[i]?,
            ema_long: self.ema_long[i]?,
            // Neutral reading while RSI is warming up
            rsi: self.rsi[i].unwrap_or(50.0),
            macd: self.macd[i]?,
            macd_signal: self.macd_signal[i]?,
            atr: self.atr[i]?,
            adx_recent: self.adx[start..=i].to_vec(),
        })
    }

    /// Entry decision at bar `i` using history up to and including `i`
    pub fn evaluate_at(&self, i: usize, params: &EntryParams) -> EntryDecision {
        if i + 1 < MIN_HISTORY {
            return EntryDecision::flat();
        }
        match self.snapshot(i) {
            Some(snapshot) => evaluate(&snapshot, params),
            None => EntryDecision::flat(),
        }
    }
}

/// Trend-strength gate: ADX at the threshold, or a rising breakout above the floor
pub fn trend_is_strong(snapshot: &IndicatorSnapshot, params: &EntryParams) -> bool {
    let adx = snapshot.adx();
    if adx >= params.adx_threshold {
        return true;
    }

    let run = &snapshot.adx_recent;
    adx > params.breakout_floor
        && run.len() >= params.breakout_run.max(2)
        && run.windows(2).all(|w| w[1] > w[0])
}

/// Combine indicator readings into a directional decision
pub fn evaluate(snapshot: &IndicatorSnapshot, params: &EntryParams) -> EntryDecision {
    if !trend_is_strong(snapshot, params) {
        return EntryDecision::flat();
    }

    if !params
        .rsi_gate
        .allows(snapshot.rsi, params.rsi_oversold, params.rsi_overbought)
    {
        return EntryDecision::flat();
    }

    let signal = if snapshot.ema_short > snapshot.ema_long && snapshot.macd > snapshot.macd_signal {
        Signal::Long
    } else if snapshot.ema_short < snapshot.ema_long && snapshot.macd < snapshot.macd_signal {
        Signal::Short
    } else {
        Signal::Flat
    };

    if signal == Signal::Flat {
        return EntryDecision::flat();
    }

    let atr_ratio = snapshot.atr_ratio();
    EntryDecision {
        signal,
        target_ror: (atr_ratio * 100.0).abs(),
        atr: snapshot.atr,
        atr_ratio,
    }
}

/// Evaluate the latest bar of a live candle window
pub fn evaluate_window(candles: &[Candle], params: &EntryParams) -> EntryDecision {
    if candles.len() < MIN_HISTORY {
        return EntryDecision::flat();
    }
    let series = IndicatorSeries::compute(candles, params);
    series.evaluate_at(candles.len() - 1, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::RsiGate;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            close: 100.0,
            ema_short: 101.0,
            ema_long: 99.0,
            rsi: 85.0,
            macd: 1.0,
            macd_signal: 0.5,
            atr: 2.0,
            adx_recent: vec![22.0, 24.0, 26.0],
        }
    }

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                Candle::new_unchecked(start + Duration::hours(4 * i as i64), c, c + 1.0, c - 1.0, c, 10.0)
            })
            .collect()
    }

    #[test]
    fn test_long_signal_with_target_from_atr() {
        let decision = evaluate(&snapshot(), &EntryParams::default());
        assert_eq!(decision.signal, Signal::Long);
        assert_relative_eq!(decision.target_ror, 2.0);
        assert_relative_eq!(decision.atr_ratio, 0.02);
    }

    #[test]
    fn test_short_signal_is_mirrored() {
        let mut snap = snapshot();
        snap.ema_short = 98.0;
        snap.macd = -1.0;
        snap.rsi = 15.0;
        assert_eq!(evaluate(&snap, &EntryParams::default()).signal, Signal::Short);
    }

    #[test]
    fn test_mixed_trend_and_macd_is_flat() {
        let mut snap = snapshot();
        snap.macd = 0.0;
        assert_eq!(evaluate(&snap, &EntryParams::default()).signal, Signal::Flat);
    }

    #[test]
    fn test_weak_trend_rejected() {
        let mut snap = snapshot();
        snap.adx_recent = vec![14.0, 13.0, 12.0];
        assert_eq!(evaluate(&snap, &EntryParams::default()).signal, Signal::Flat);
    }

    #[test]
    fn test_rising_adx_above_floor_counts_as_breakout() {
        let mut snap = snapshot();
        snap.adx_recent = vec![16.0, 17.0, 18.0];
        assert_eq!(evaluate(&snap, &EntryParams::default()).signal, Signal::Long);

        // Not strictly rising
        snap.adx_recent = vec![16.0, 18.0, 18.0];
        assert_eq!(evaluate(&snap, &EntryParams::default()).signal, Signal::Flat);

        // Rising but below the floor
        snap.adx_recent = vec![12.0, 13.0, 14.0];
        assert_eq!(evaluate(&snap, &EntryParams::default()).signal, Signal::Flat);
    }

    #[test]
    fn test_rsi_gate() {
        let mut snap = snapshot();
        snap.rsi = 50.0;
        let mut params = EntryParams::default();
        assert_eq!(evaluate(&snap, &params).signal, Signal::Flat);

        params.rsi_gate = RsiGate::Band;
        assert_eq!(evaluate(&snap, &params).signal, Signal::Long);
    }

    #[test]
    fn test_short_window_is_flat() {
        let closes: Vec<f64> = (0..49).map(|i| 100.0 + i as f64).collect();
        let decision = evaluate_window(&candles_from(&closes), &EntryParams::default());
        assert_eq!(decision.signal, Signal::Flat);
    }

    #[test]
    fn test_flat_prices_never_signal() {
        let candles = candles_from(&vec![100.0; 200]);
        let params = EntryParams::default();
        let series = IndicatorSeries::compute(&candles, &params);
        for i in 0..series.len() {
            assert_eq!(series.evaluate_at(i, &params).signal, Signal::Flat);
        }
    }

    #[test]
    fn test_steady_uptrend_goes_long() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let decision = evaluate_window(&candles_from(&closes), &EntryParams::default());
        assert_eq!(decision.signal, Signal::Long);
        assert!(decision.target_ror > 0.0);
    }
}
