//! Candles, symbols, sides and trade records shared by every module

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Reasons a raw OHLCV row is rejected
#[derive(Debug, Error, PartialEq)]
pub enum CandleValidationError {
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("inverted range: high {high} below low {low}")]
    InvertedRange { high: f64, low: f64 },

    #[error("{field} {value} outside [{low}, {high}]")]
    OutsideRange {
        field: &'static str,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error("negative volume {0}")]
    NegativeVolume(f64),
}

/// One OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self::new_unchecked(datetime, open, high, low, close, volume);
        candle.validate()?;
        Ok(candle)
    }

    /// Build a bar from a trusted source (exchange klines, generated series)
    pub fn new_unchecked(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Candle {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn validate(&self) -> Result<(), CandleValidationError> {
        let prices = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ];
        if let Some((field, value)) = prices.into_iter().find(|(_, v)| *v <= 0.0) {
            return Err(CandleValidationError::NonPositive { field, value });
        }
        if self.high < self.low {
            return Err(CandleValidationError::InvertedRange {
                high: self.high,
                low: self.low,
            });
        }
        for (field, value) in [("open", self.open), ("close", self.close)] {
            if !(self.low..=self.high).contains(&value) {
                return Err(CandleValidationError::OutsideRange {
                    field,
                    value,
                    low: self.low,
                    high: self.high,
                });
            }
        }
        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }
        Ok(())
    }

    /// ATR as a fraction of the close; 0 for a non-positive close
    pub fn atr_ratio(&self, atr: f64) -> f64 {
        if self.close > 0.0 {
            atr / self.close
        } else {
            0.0
        }
    }
}

/// Exchange symbol such as `ETHUSDT`
///
/// Cloned into every registry entry, trade and notification, hence the
/// shared `Arc<str>`. Serialises as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Symbol(Arc<str>);

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol(Arc::from(s))
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0.to_string()
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Side-adjusted return on risk, in percent of the entry price
    pub fn ror(self, entry_price: f64, price: f64) -> f64 {
        if entry_price <= 0.0 {
            return 0.0;
        }
        match self {
            Side::Long => (price - entry_price) / entry_price * 100.0,
            Side::Short => (entry_price - price) / entry_price * 100.0,
        }
    }

    /// Sign applied to quantity when computing pnl
    pub fn direction(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Directional decision produced by the entry evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Long,
    Short,
    Flat,
}

impl Signal {
    pub fn side(self) -> Option<Side> {
        match self {
            Signal::Long => Some(Side::Long),
            Signal::Short => Some(Side::Short),
            Signal::Flat => None,
        }
    }
}

/// Completed trade record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl: f64,
    pub commission: f64,
    pub net_pnl: f64,
    pub exit_reason: String,
}

impl Trade {
    /// Side-adjusted return percentage
    pub fn return_pct(&self) -> f64 {
        self.side.ror(self.entry_price, self.exit_price)
    }
}

/// Statistics of one completed single-run backtest
///
/// Only produced when at least one trade closed; a run without trades is
/// reported as `None` by the backtester.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    /// Account return over the run, in percent
    pub ror: f64,
    pub sharpe: f64,
    /// Peak-to-trough equity drawdown, in percent
    pub max_drawdown: f64,
    /// Winning trades share, in percent
    pub win_rate: f64,
    pub trade_count: usize,
    pub pnl: f64,
    pub won: usize,
    pub lost: usize,
    /// |average win / average loss|, 0 when there were no losses
    pub pl_ratio: f64,
    pub final_equity: f64,
}
