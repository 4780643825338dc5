//! Coin Trader
//!
//! Per-coin futures trend strategy: indicator-based entries, a phased
//! trailing-stop exit state machine, a backtester, two-stage grid search with
//! robustness scoring and walk-forward validation, and a polling live trader.

pub mod backtest;
pub mod binance;
pub mod config;
pub mod data;
pub mod exchange;
pub mod exit;
pub mod indicators;
pub mod journal;
pub mod notify;
pub mod optimizer;
pub mod params;
pub mod registry;
pub mod robust;
pub mod signal;
pub mod slices;
pub mod trader;
pub mod types;
pub mod walk_forward;

pub use config::Config;
pub use params::{EntryParams, ExitParams, StrategyParams};
pub use types::*;
