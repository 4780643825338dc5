//! Phased exit state machine
//!
//! Each open position owns one [`ExitState`]. Every tick feeds the current
//! ROR (plus the current ATR ratio and the time in trade) and receives either
//! `Hold` or `Close` with a reason. The stop only ever ratchets upward:
//!
//! | phase | reached when `highest_ror` | stop becomes |
//! |---|---|---|
//! | 1 | `< phase2_threshold` | initial stop |
//! | 2 | `< phase3_threshold` | `max(stop, breakeven_stop)` |
//! | 3 | `< target_ror` | `max(stop, highest * trailing_ratio)` |
//! | 4 | otherwise | `max(stop, highest * tight_trailing_ratio)` |
//!
//! Boundaries belong to the higher phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::ExitParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// Fixed initial stop
    Initial,
    /// Stop locked at breakeven
    Breakeven,
    /// Trailing stop
    Trailing,
    /// Tight trailing stop past the target
    TightTrailing,
}

impl Phase {
    pub fn number(self) -> u8 {
        match self {
            Phase::Initial => 1,
            Phase::Breakeven => 2,
            Phase::Trailing => 3,
            Phase::TightTrailing => 4,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "phase {}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    VolatilitySpike,
    TimeExit,
    /// Position still open when the replayed series ended
    EndOfData,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop loss",
            ExitReason::TrailingStop => "trailing stop",
            ExitReason::VolatilitySpike => "volatility spike",
            ExitReason::TimeExit => "time exit",
            ExitReason::EndOfData => "end of data",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Hold,
    Close(ExitReason),
}

impl ExitDecision {
    pub fn is_close(&self) -> bool {
        matches!(self, ExitDecision::Close(_))
    }
}

/// One observation of an open position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitTick {
    /// Current side-adjusted ROR in percent
    pub ror: f64,
    /// Current ATR / price, when known
    pub atr_ratio: Option<f64>,
    /// Time in trade measured in bars (fractional for wall-clock sources)
    pub elapsed_bars: f64,
}

/// Per-position exit controller state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitState {
    pub phase: Phase,
    pub highest_ror: f64,
    pub stop_loss_ror: f64,
    pub target_ror: f64,
    pub entry_atr_ratio: f64,
    pub trailing_active: bool,
    pub opened_at: DateTime<Utc>,
}

impl ExitState {
    /// Initial state for a freshly opened position
    ///
    /// A proposed target at or below `min_target_ror` (including the 0 used
    /// on restart) falls back to the configured target and default stop;
    /// otherwise the stop starts at `-initial_stop_ratio * target`.
    pub fn open(
        proposed_target: f64,
        entry_atr_ratio: f64,
        opened_at: DateTime<Utc>,
        params: &ExitParams,
    ) -> Self {
        let (target_ror, stop_loss_ror) = if proposed_target <= params.min_target_ror {
            (params.target_ror, params.default_stop_loss)
        } else {
            (proposed_target, -params.initial_stop_ratio * proposed_target)
        };

        ExitState {
            phase: Phase::Initial,
            highest_ror: 0.0,
            stop_loss_ror,
            target_ror,
            entry_atr_ratio,
            trailing_active: false,
            opened_at,
        }
    }

    /// Neutral state for a position discovered without local history
    pub fn restore(opened_at: DateTime<Utc>, params: &ExitParams) -> Self {
        Self::open(0.0, params.neutral_atr_ratio, opened_at, params)
    }

    /// Advance `highest_ror`, the phase and the stop for a new ROR reading
    pub fn update_stop(&mut self, ror: f64, params: &ExitParams) {
        if ror > self.highest_ror {
            self.highest_ror = ror;
        }
        let highest = self.highest_ror;

        if highest < params.phase2_threshold {
            self.phase = self.phase.max(Phase::Initial);
        } else if highest < params.phase3_threshold {
            self.phase = self.phase.max(Phase::Breakeven);
            self.stop_loss_ror = self.stop_loss_ror.max(params.breakeven_stop);
        } else if highest < self.target_ror {
            self.phase = self.phase.max(Phase::Trailing);
            self.trailing_active = true;
            self.stop_loss_ror = self.stop_loss_ror.max(highest * params.trailing_ratio);
        } else {
            self.phase = Phase::TightTrailing;
            self.trailing_active = true;
            self.stop_loss_ror = self
                .stop_loss_ror
                .max(highest * params.tight_trailing_ratio);
        }
    }

    fn volatility_spiked(&self, atr_ratio: Option<f64>, params: &ExitParams) -> bool {
        match atr_ratio {
            Some(current) if self.entry_atr_ratio > 0.0 => {
                current > self.entry_atr_ratio * params.volatility_spike
            }
            _ => false,
        }
    }

    fn timed_out(&self, elapsed_bars: f64, params: &ExitParams) -> bool {
        (elapsed_bars > params.time_exit_bars1 && self.highest_ror < params.time_exit_ror1)
            || (elapsed_bars > params.time_exit_bars2 && self.highest_ror < params.time_exit_ror2)
    }

    /// Process one tick and decide whether to close
    pub fn tick(&mut self, tick: ExitTick, params: &ExitParams) -> ExitDecision {
        self.update_stop(tick.ror, params);

        if tick.ror < self.stop_loss_ror {
            let reason = if self.trailing_active {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopLoss
            };
            return ExitDecision::Close(reason);
        }

        if self.volatility_spiked(tick.atr_ratio, params) {
            return ExitDecision::Close(ExitReason::VolatilitySpike);
        }

        if self.timed_out(tick.elapsed_bars, params) {
            return ExitDecision::Close(ExitReason::TimeExit);
        }

        ExitDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn tick(ror: f64, elapsed_bars: f64) -> ExitTick {
        ExitTick {
            ror,
            atr_ratio: None,
            elapsed_bars,
        }
    }

    fn fresh(params: &ExitParams) -> ExitState {
        ExitState::open(0.0, 0.02, Utc::now(), params)
    }

    #[test]
    fn test_open_uses_defaults_for_small_targets() {
        let params = ExitParams::default();
        let state = ExitState::open(3.0, 0.03, Utc::now(), &params);
        assert_relative_eq!(state.target_ror, 7.0);
        assert_relative_eq!(state.stop_loss_ror, -4.0);

        let state = ExitState::open(5.0, 0.05, Utc::now(), &params);
        assert_relative_eq!(state.target_ror, 7.0);
    }

    #[test]
    fn test_open_derives_stop_from_large_target() {
        let params = ExitParams::default();
        let state = ExitState::open(10.0, 0.1, Utc::now(), &params);
        assert_relative_eq!(state.target_ror, 10.0);
        assert_relative_eq!(state.stop_loss_ror, -4.0);

        let state = ExitState::open(20.0, 0.2, Utc::now(), &params);
        assert_relative_eq!(state.stop_loss_ror, -8.0);
    }

    #[test]
    fn test_restore_is_neutral() {
        let params = ExitParams::default();
        let state = ExitState::restore(Utc::now(), &params);
        assert_eq!(state.phase, Phase::Initial);
        assert_relative_eq!(state.entry_atr_ratio, 0.05);
        assert_relative_eq!(state.target_ror, params.target_ror);
    }

    #[test]
    fn test_boundaries_belong_to_higher_phase() {
        let params = ExitParams::default();

        let mut state = fresh(&params);
        state.update_stop(params.phase2_threshold, &params);
        assert_eq!(state.phase, Phase::Breakeven);
        assert_relative_eq!(state.stop_loss_ror, params.breakeven_stop);

        let mut state = fresh(&params);
        state.update_stop(params.phase3_threshold, &params);
        assert_eq!(state.phase, Phase::Trailing);
        assert!(state.trailing_active);
        assert_relative_eq!(state.stop_loss_ror, 5.0 * 0.6);

        let mut state = fresh(&params);
        state.update_stop(state.target_ror, &params);
        assert_eq!(state.phase, Phase::TightTrailing);
        assert_relative_eq!(state.stop_loss_ror, 7.0 * 0.75);
    }

    #[test]
    fn test_rise_to_ten_ends_in_phase_four() {
        let params = ExitParams::default();
        let mut state = fresh(&params);
        for step in 0..=100 {
            let decision = state.tick(tick(step as f64 * 0.1, 1.0), &params);
            assert_eq!(decision, ExitDecision::Hold);
        }
        assert_eq!(state.phase, Phase::TightTrailing);
        assert_relative_eq!(state.highest_ror, 10.0, epsilon = 1e-9);
        assert_relative_eq!(state.stop_loss_ror, 7.5, epsilon = 1e-9);
    }

    #[test]
    fn test_pullback_hits_trailing_stop() {
        let params = ExitParams::default();
        let mut state = fresh(&params);
        state.tick(tick(6.0, 1.0), &params);
        assert_eq!(
            state.tick(tick(3.5, 2.0), &params),
            ExitDecision::Close(ExitReason::TrailingStop)
        );
    }

    #[test]
    fn test_initial_stop_is_plain_stop_loss() {
        let params = ExitParams::default();
        let mut state = fresh(&params);
        assert_eq!(
            state.tick(tick(-4.5, 1.0), &params),
            ExitDecision::Close(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_volatility_spike_closes() {
        let params = ExitParams::default();
        let mut state = fresh(&params);
        let spike = ExitTick {
            ror: 0.5,
            atr_ratio: Some(0.07),
            elapsed_bars: 1.0,
        };
        assert_eq!(
            state.tick(spike, &params),
            ExitDecision::Close(ExitReason::VolatilitySpike)
        );

        let calm = ExitTick {
            ror: 0.5,
            atr_ratio: Some(0.05),
            elapsed_bars: 1.0,
        };
        assert_eq!(fresh(&params).tick(calm, &params), ExitDecision::Hold);
    }

    #[test]
    fn test_stop_takes_priority_over_volatility() {
        let params = ExitParams::default();
        let mut state = fresh(&params);
        let both = ExitTick {
            ror: -5.0,
            atr_ratio: Some(1.0),
            elapsed_bars: 20.0,
        };
        assert_eq!(
            state.tick(both, &params),
            ExitDecision::Close(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_flat_position_times_out() {
        let params = ExitParams::default();
        let mut state = fresh(&params);
        for bar in 1..=6 {
            assert_eq!(state.tick(tick(0.5, bar as f64), &params), ExitDecision::Hold);
        }
        assert_eq!(
            state.tick(tick(0.5, 7.0), &params),
            ExitDecision::Close(ExitReason::TimeExit)
        );
    }

    #[test]
    fn test_second_time_floor() {
        let params = ExitParams::default();
        let mut state = fresh(&params);
        // Above the first floor, below the second
        state.tick(tick(1.5, 1.0), &params);
        assert_eq!(state.tick(tick(1.0, 12.0), &params), ExitDecision::Hold);
        assert_eq!(
            state.tick(tick(1.0, 13.0), &params),
            ExitDecision::Close(ExitReason::TimeExit)
        );
    }

    proptest! {
        #[test]
        fn prop_stop_and_highest_never_decrease(rors in prop::collection::vec(-10.0f64..30.0, 1..60)) {
            let params = ExitParams::default();
            let mut state = fresh(&params);
            for (i, ror) in rors.into_iter().enumerate() {
                let stop_before = state.stop_loss_ror;
                let highest_before = state.highest_ror;
                let phase_before = state.phase;
                state.tick(tick(ror, i as f64), &params);
                prop_assert!(state.stop_loss_ror >= stop_before);
                prop_assert!(state.highest_ror >= highest_before);
                prop_assert!(state.phase >= phase_before);
            }
        }
    }
}
