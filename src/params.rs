//! Strategy parameters
//!
//! A flat set of named numeric knobs split into an entry subset (indicator
//! periods and gates) and an exit subset (the phased stop policy). Grids,
//! coin tables and reports all address knobs by name, so every knob can be
//! read and written through [`StrategyParams::get`] / [`StrategyParams::set`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Knob names belonging to the entry subset
pub const ENTRY_KNOBS: &[&str] = &[
    "ema_short",
    "ema_long",
    "rsi_period",
    "rsi_overbought",
    "rsi_oversold",
    "atr_period",
    "atr_multiplier",
    "adx_period",
    "adx_threshold",
    "breakout_floor",
    "breakout_run",
];

/// Knob names belonging to the exit subset
pub const EXIT_KNOBS: &[&str] = &[
    "target_ror",
    "default_stop_loss",
    "min_target_ror",
    "initial_stop_ratio",
    "phase2_threshold",
    "phase3_threshold",
    "breakeven_stop",
    "trailing_ratio",
    "tight_trailing_ratio",
    "time_exit_bars1",
    "time_exit_ror1",
    "time_exit_bars2",
    "time_exit_ror2",
    "volatility_spike",
    "neutral_atr_ratio",
];

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("unknown parameter: {0}")]
    Unknown(String),

    #[error("parameter {name} must be a positive integer, got {value}")]
    NotAPeriod { name: String, value: f64 },

    #[error("ema_short ({short}) must be < ema_long ({long})")]
    MovingAverageOrder { short: usize, long: usize },
}

/// Which side of the RSI bounds lets a signal through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RsiGate {
    /// Fire only at or beyond a bound (trade with momentum)
    #[default]
    Momentum,
    /// Fire only strictly between the bounds
    Band,
}

impl RsiGate {
    pub fn allows(self, rsi: f64, oversold: f64, overbought: f64) -> bool {
        let inside = rsi > oversold && rsi < overbought;
        match self {
            RsiGate::Momentum => !inside,
            RsiGate::Band => inside,
        }
    }
}

/// Entry-signal knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryParams {
    pub ema_short: usize,
    pub ema_long: usize,
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub atr_period: usize,
    /// Stop distance in ATRs, used for position sizing
    pub atr_multiplier: f64,
    pub adx_period: usize,
    pub adx_threshold: f64,
    /// Lower ADX floor for the rising-ADX breakout rule
    pub breakout_floor: f64,
    /// Number of consecutive ADX samples that must be strictly rising
    pub breakout_run: usize,
    pub rsi_gate: RsiGate,
}

impl Default for EntryParams {
    fn default() -> Self {
        EntryParams {
            ema_short: 10,
            ema_long: 30,
            rsi_period: 14,
            rsi_overbought: 80.0,
            rsi_oversold: 20.0,
            atr_period: 14,
            atr_multiplier: 2.2,
            adx_period: 14,
            adx_threshold: 20.0,
            breakout_floor: 15.0,
            breakout_run: 3,
            rsi_gate: RsiGate::Momentum,
        }
    }
}

/// Exit-policy knobs (all RORs in percent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitParams {
    pub target_ror: f64,
    pub default_stop_loss: f64,
    /// Proposed targets at or below this fall back to the default target/stop
    pub min_target_ror: f64,
    /// Initial stop = -initial_stop_ratio * proposed target
    pub initial_stop_ratio: f64,
    pub phase2_threshold: f64,
    pub phase3_threshold: f64,
    pub breakeven_stop: f64,
    pub trailing_ratio: f64,
    pub tight_trailing_ratio: f64,
    pub time_exit_bars1: f64,
    pub time_exit_ror1: f64,
    pub time_exit_bars2: f64,
    pub time_exit_ror2: f64,
    pub volatility_spike: f64,
    /// Entry ATR ratio assumed when the state is rebuilt without history
    pub neutral_atr_ratio: f64,
}

impl Default for ExitParams {
    fn default() -> Self {
        ExitParams {
            target_ror: 7.0,
            default_stop_loss: -4.0,
            min_target_ror: 5.0,
            initial_stop_ratio: 0.4,
            phase2_threshold: 3.0,
            phase3_threshold: 5.0,
            breakeven_stop: 0.5,
            trailing_ratio: 0.6,
            tight_trailing_ratio: 0.75,
            time_exit_bars1: 6.0,
            time_exit_ror1: 1.0,
            time_exit_bars2: 12.0,
            time_exit_ror2: 2.0,
            volatility_spike: 3.0,
            neutral_atr_ratio: 0.05,
        }
    }
}

/// Full parameter set for one strategy run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub entry: EntryParams,
    pub exit: ExitParams,
}

fn period(name: &str, value: f64) -> Result<usize, ParamError> {
    if value >= 1.0 && value.fract() == 0.0 {
        Ok(value as usize)
    } else {
        Err(ParamError::NotAPeriod {
            name: name.to_string(),
            value,
        })
    }
}

impl StrategyParams {
    /// Build from defaults plus a flat map of overrides
    pub fn from_overrides<'a, I>(overrides: I) -> Result<Self, ParamError>
    where
        I: IntoIterator<Item = (&'a String, &'a f64)>,
    {
        let mut params = StrategyParams::default();
        for (name, value) in overrides {
            params.set(name, *value)?;
        }
        params.validate()?;
        Ok(params)
    }

    /// Read a knob by name
    pub fn get(&self, name: &str) -> Option<f64> {
        let e = &self.entry;
        let x = &self.exit;
        let value = match name {
            "ema_short" => e.ema_short as f64,
            "ema_long" => e.ema_long as f64,
            "rsi_period" => e.rsi_period as f64,
            "rsi_overbought" => e.rsi_overbought,
            "rsi_oversold" => e.rsi_oversold,
            "atr_period" => e.atr_period as f64,
            "atr_multiplier" => e.atr_multiplier,
            "adx_period" => e.adx_period as f64,
            "adx_threshold" => e.adx_threshold,
            "breakout_floor" => e.breakout_floor,
            "breakout_run" => e.breakout_run as f64,
            "target_ror" => x.target_ror,
            "default_stop_loss" => x.default_stop_loss,
            "min_target_ror" => x.min_target_ror,
            "initial_stop_ratio" => x.initial_stop_ratio,
            "phase2_threshold" => x.phase2_threshold,
            "phase3_threshold" => x.phase3_threshold,
            "breakeven_stop" => x.breakeven_stop,
            "trailing_ratio" => x.trailing_ratio,
            "tight_trailing_ratio" => x.tight_trailing_ratio,
            "time_exit_bars1" => x.time_exit_bars1,
            "time_exit_ror1" => x.time_exit_ror1,
            "time_exit_bars2" => x.time_exit_bars2,
            "time_exit_ror2" => x.time_exit_ror2,
            "volatility_spike" => x.volatility_spike,
            "neutral_atr_ratio" => x.neutral_atr_ratio,
            _ => return None,
        };
        Some(value)
    }

    /// Write a knob by name
    ///
    /// Does not check `ema_short < ema_long`; call [`StrategyParams::validate`]
    /// once all knobs of a combination are applied.
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), ParamError> {
        let e = &mut self.entry;
        let x = &mut self.exit;
        match name {
            "ema_short" => e.ema_short = period(name, value)?,
            "ema_long" => e.ema_long = period(name, value)?,
            "rsi_period" => e.rsi_period = period(name, value)?,
            "rsi_overbought" => e.rsi_overbought = value,
            "rsi_oversold" => e.rsi_oversold = value,
            "atr_period" => e.atr_period = period(name, value)?,
            "atr_multiplier" => e.atr_multiplier = value,
            "adx_period" => e.adx_period = period(name, value)?,
            "adx_threshold" => e.adx_threshold = value,
            "breakout_floor" => e.breakout_floor = value,
            "breakout_run" => e.breakout_run = period(name, value)?,
            "target_ror" => x.target_ror = value,
            "default_stop_loss" => x.default_stop_loss = value,
            "min_target_ror" => x.min_target_ror = value,
            "initial_stop_ratio" => x.initial_stop_ratio = value,
            "phase2_threshold" => x.phase2_threshold = value,
            "phase3_threshold" => x.phase3_threshold = value,
            "breakeven_stop" => x.breakeven_stop = value,
            "trailing_ratio" => x.trailing_ratio = value,
            "tight_trailing_ratio" => x.tight_trailing_ratio = value,
            "time_exit_bars1" => x.time_exit_bars1 = value,
            "time_exit_ror1" => x.time_exit_ror1 = value,
            "time_exit_bars2" => x.time_exit_bars2 = value,
            "time_exit_ror2" => x.time_exit_ror2 = value,
            "volatility_spike" => x.volatility_spike = value,
            "neutral_atr_ratio" => x.neutral_atr_ratio = value,
            _ => return Err(ParamError::Unknown(name.to_string())),
        }
        Ok(())
    }

    /// Enforce the moving-average ordering invariant
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.entry.ema_short >= self.entry.ema_long {
            return Err(ParamError::MovingAverageOrder {
                short: self.entry.ema_short,
                long: self.entry.ema_long,
            });
        }
        Ok(())
    }

    /// Copy only the entry subset from `other`
    pub fn with_entry(&self, other: &StrategyParams) -> StrategyParams {
        StrategyParams {
            entry: other.entry.clone(),
            exit: self.exit.clone(),
        }
    }

    /// All knobs as a flat map (for reporting and stability checks)
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        ENTRY_KNOBS
            .iter()
            .chain(EXIT_KNOBS.iter())
            .filter_map(|k| self.get(k).map(|v| (k.to_string(), v)))
            .collect()
    }
}

/// Format selected knobs for display, e.g. `EMA=10/30 RSI=20/80 ...`
pub fn format_params(p: &StrategyParams) -> String {
    format!(
        "EMA={}/{} RSI={}/{} ADX>={} ATRx{} Target={}% Trail={}/{}",
        p.entry.ema_short,
        p.entry.ema_long,
        p.entry.rsi_oversold,
        p.entry.rsi_overbought,
        p.entry.adx_threshold,
        p.entry.atr_multiplier,
        p.exit.target_ror,
        p.exit.trailing_ratio,
        p.exit.tight_trailing_ratio,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_knob_round_trips_through_get() {
        let params = StrategyParams::default();
        for knob in ENTRY_KNOBS.iter().chain(EXIT_KNOBS.iter()) {
            assert!(params.get(knob).is_some(), "missing getter for {}", knob);
            let mut copy = params.clone();
            copy.set(knob, params.get(knob).unwrap()).unwrap();
            assert_eq!(copy, params);
        }
    }

    #[test]
    fn test_unknown_knob_is_rejected() {
        let mut params = StrategyParams::default();
        assert_eq!(
            params.set("ema_medium", 12.0),
            Err(ParamError::Unknown("ema_medium".to_string()))
        );
    }

    #[test]
    fn test_fractional_period_is_rejected() {
        let mut params = StrategyParams::default();
        assert!(matches!(
            params.set("ema_short", 2.5),
            Err(ParamError::NotAPeriod { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_short_not_below_long() {
        let mut params = StrategyParams::default();
        params.set("ema_short", 30.0).unwrap();
        assert!(params.validate().is_err());
        params.set("ema_short", 29.0).unwrap();
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_rsi_gate_modes() {
        assert!(RsiGate::Momentum.allows(85.0, 20.0, 80.0));
        assert!(RsiGate::Momentum.allows(80.0, 20.0, 80.0));
        assert!(!RsiGate::Momentum.allows(50.0, 20.0, 80.0));
        assert!(RsiGate::Band.allows(50.0, 20.0, 80.0));
        assert!(!RsiGate::Band.allows(20.0, 20.0, 80.0));
    }

    #[test]
    fn test_from_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("ema_short".to_string(), 5.0);
        overrides.insert("ema_long".to_string(), 20.0);
        overrides.insert("target_ror".to_string(), 15.0);
        let params = StrategyParams::from_overrides(&overrides).unwrap();
        assert_eq!(params.entry.ema_short, 5);
        assert_eq!(params.entry.ema_long, 20);
        assert_eq!(params.exit.target_ror, 15.0);
        assert_eq!(params.exit.trailing_ratio, 0.6);
    }
}
