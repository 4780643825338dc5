//! Execution collaborator
//!
//! The live loop talks to an exchange only through the [`Exchange`] trait.
//! Every method may fail transiently; callers log the [`ExchangeError`] and
//! retry on the next cycle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::types::{Candle, Side, Symbol};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("exchange rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("API credentials are not configured")]
    MissingCredentials,

    #[error("failed to sign request")]
    Signing,

    #[error("no price available for {0}")]
    NoPrice(Symbol),

    #[error("no open position for {0}")]
    NoPosition(Symbol),

    #[error("insufficient balance: need {needed:.2}, available {available:.2}")]
    InsufficientBalance { needed: f64, available: f64 },

    #[error("invalid quantity {0}")]
    InvalidQuantity(f64),
}

/// An open position as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: Symbol,
    pub side: Side,
    /// Absolute contract quantity
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    /// Unrealised PnL relative to the initial margin, in percent
    pub unrealized_ror: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub total: f64,
    pub available: f64,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
    ) -> Result<(), ExchangeError>;

    /// Flatten the whole position in `symbol` with a market order
    async fn close_position(&self, symbol: &Symbol) -> Result<(), ExchangeError>;

    async fn get_open_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError>;

    async fn get_balance(&self) -> Result<Balance, ExchangeError>;

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError>;

    /// Most recent `limit` candles of `timeframe`, oldest first
    async fn get_candles(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;
}

/// Floor `quantity` to `precision` decimal places
///
/// Returns 0 for non-finite or non-positive input.
pub fn floor_quantity(quantity: f64, precision: u32) -> f64 {
    if !quantity.is_finite() || quantity <= 0.0 {
        return 0.0;
    }
    Decimal::from_f64(quantity)
        .map(|d| d.round_dp_with_strategy(precision, RoundingStrategy::ToZero))
        .and_then(|d| d.to_f64())
        .unwrap_or(0.0)
}

/// ROR in percent of a leveraged position's initial margin
pub fn margin_ror(pnl: f64, size: f64, entry_price: f64, leverage: u32) -> f64 {
    let margin = size * entry_price / leverage.max(1) as f64;
    if margin > 0.0 {
        pnl / margin * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
struct PaperPosition {
    side: Side,
    size: f64,
    entry_price: f64,
    leverage: u32,
}

impl PaperPosition {
    fn margin(&self) -> f64 {
        self.size * self.entry_price / self.leverage.max(1) as f64
    }

    fn pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size * self.side.direction()
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    cash: f64,
    prices: HashMap<Symbol, f64>,
    candles: HashMap<Symbol, Vec<Candle>>,
    leverage: HashMap<Symbol, u32>,
    positions: HashMap<Symbol, PaperPosition>,
}

/// In-memory exchange that fills market orders at the last known price
///
/// Prices and candles come from an optional market-data feed (typically the
/// real exchange's public endpoints) or are set directly.
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    feed: Option<Arc<dyn Exchange>>,
    fee_rate: f64,
}

impl PaperExchange {
    pub fn new(initial_cash: f64, fee_rate: f64) -> Self {
        PaperExchange {
            book: Mutex::new(PaperBook {
                cash: initial_cash,
                ..PaperBook::default()
            }),
            feed: None,
            fee_rate,
        }
    }

    /// Use `feed` for prices and candles
    pub fn with_feed(mut self, feed: Arc<dyn Exchange>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub async fn set_price(&self, symbol: &Symbol, price: f64) {
        self.book.lock().await.prices.insert(symbol.clone(), price);
    }

    pub async fn set_candles(&self, symbol: &Symbol, candles: Vec<Candle>) {
        let mut book = self.book.lock().await;
        if let Some(last) = candles.last() {
            book.prices.insert(symbol.clone(), last.close);
        }
        book.candles.insert(symbol.clone(), candles);
    }

    async fn mark(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        if let Some(feed) = &self.feed {
            let price = feed.get_price(symbol).await?;
            self.book.lock().await.prices.insert(symbol.clone(), price);
            return Ok(price);
        }
        self.book
            .lock()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::NoPrice(symbol.clone()))
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        self.mark(symbol).await
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
    ) -> Result<(), ExchangeError> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(ExchangeError::InvalidQuantity(quantity));
        }
        let price = self.mark(symbol).await?;
        let mut book = self.book.lock().await;

        if let Some(existing) = book.positions.get(symbol) {
            if existing.side != side {
                // Opposite order reduces an existing position
                let mut position = existing.clone();
                let closed = quantity.min(position.size);
                let part = PaperPosition {
                    size: closed,
                    ..position.clone()
                };
                let fee = closed * price * self.fee_rate;
                book.cash += part.margin() + part.pnl(price) - fee;
                position.size -= closed;
                if position.size <= f64::EPSILON {
                    book.positions.remove(symbol);
                } else {
                    book.positions.insert(symbol.clone(), position);
                }
                debug!(%symbol, closed, price, "Paper position reduced");
                return Ok(());
            }
        }

        let leverage = book.leverage.get(symbol).copied().unwrap_or(1);
        let notional = quantity * price;
        let needed = notional / leverage.max(1) as f64 + notional * self.fee_rate;
        if needed > book.cash {
            return Err(ExchangeError::InsufficientBalance {
                needed,
                available: book.cash,
            });
        }
        book.cash -= needed;

        let position = book
            .positions
            .entry(symbol.clone())
            .or_insert(PaperPosition {
                side,
                size: 0.0,
                entry_price: price,
                leverage,
            });
        let total = position.size + quantity;
        position.entry_price = (position.entry_price * position.size + price * quantity) / total;
        position.size = total;

        info!(%symbol, %side, quantity, price, "Paper order filled");
        Ok(())
    }

    async fn close_position(&self, symbol: &Symbol) -> Result<(), ExchangeError> {
        let price = self.mark(symbol).await?;
        let mut book = self.book.lock().await;
        let position = book
            .positions
            .remove(symbol)
            .ok_or_else(|| ExchangeError::NoPosition(symbol.clone()))?;
        let fee = position.size * price * self.fee_rate;
        book.cash += position.margin() + position.pnl(price) - fee;
        info!(%symbol, price, pnl = position.pnl(price), "Paper position closed");
        Ok(())
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
        let symbols: Vec<Symbol> = self.book.lock().await.positions.keys().cloned().collect();
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let price = self.mark(&symbol).await?;
            let book = self.book.lock().await;
            if let Some(p) = book.positions.get(&symbol) {
                let pnl = p.pnl(price);
                out.push(PositionInfo {
                    symbol: symbol.clone(),
                    side: p.side,
                    size: p.size,
                    entry_price: p.entry_price,
                    mark_price: price,
                    unrealized_pnl: pnl,
                    unrealized_ror: margin_ror(pnl, p.size, p.entry_price, p.leverage),
                });
            }
        }
        Ok(out)
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        let book = self.book.lock().await;
        let locked: f64 = book
            .positions
            .iter()
            .map(|(symbol, p)| {
                let price = book.prices.get(symbol).copied().unwrap_or(p.entry_price);
                p.margin() + p.pnl(price)
            })
            .sum();
        Ok(Balance {
            total: book.cash + locked,
            available: book.cash,
        })
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError> {
        self.book
            .lock()
            .await
            .leverage
            .insert(symbol.clone(), leverage.max(1));
        Ok(())
    }

    async fn get_candles(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        if let Some(feed) = &self.feed {
            return feed.get_candles(symbol, timeframe, limit).await;
        }
        let book = self.book.lock().await;
        let candles = book.candles.get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        debug!(%symbol, timeframe, "Serving paper candles");
        Ok(candles.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_floor_quantity() {
        assert_relative_eq!(floor_quantity(1.23789, 2), 1.23);
        assert_relative_eq!(floor_quantity(0.0199, 3), 0.019);
        assert_relative_eq!(floor_quantity(57.9, 0), 57.0);
        assert_eq!(floor_quantity(-1.0, 2), 0.0);
        assert_eq!(floor_quantity(f64::NAN, 2), 0.0);
    }

    #[test]
    fn test_margin_ror_scales_with_leverage() {
        // 1 unit at 100, price moves to 101
        assert_relative_eq!(margin_ror(1.0, 1.0, 100.0, 1), 1.0);
        assert_relative_eq!(margin_ror(1.0, 1.0, 100.0, 2), 2.0);
        assert_eq!(margin_ror(1.0, 0.0, 100.0, 2), 0.0);
    }

    #[tokio::test]
    async fn test_paper_round_trip() {
        let exchange = PaperExchange::new(1000.0, 0.0);
        let symbol = Symbol::new("ETHUSDT");
        exchange.set_price(&symbol, 100.0).await;
        exchange.set_leverage(&symbol, 2).await.unwrap();

        exchange
            .place_market_order(&symbol, Side::Long, 4.0)
            .await
            .unwrap();
        let balance = exchange.get_balance().await.unwrap();
        assert_relative_eq!(balance.available, 800.0);
        assert_relative_eq!(balance.total, 1000.0);

        exchange.set_price(&symbol, 105.0).await;
        let positions = exchange.get_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Long);
        assert_relative_eq!(positions[0].unrealized_pnl, 20.0);
        assert_relative_eq!(positions[0].unrealized_ror, 10.0);

        exchange.close_position(&symbol).await.unwrap();
        assert!(exchange.get_open_positions().await.unwrap().is_empty());
        assert_relative_eq!(exchange.get_balance().await.unwrap().total, 1020.0);
    }

    #[tokio::test]
    async fn test_paper_short_and_errors() {
        let exchange = PaperExchange::new(100.0, 0.0);
        let symbol = Symbol::new("SOLUSDT");
        assert!(matches!(
            exchange.get_price(&symbol).await,
            Err(ExchangeError::NoPrice(_))
        ));

        exchange.set_price(&symbol, 10.0).await;
        assert!(matches!(
            exchange.place_market_order(&symbol, Side::Short, 50.0).await,
            Err(ExchangeError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            exchange.close_position(&symbol).await,
            Err(ExchangeError::NoPosition(_))
        ));

        exchange
            .place_market_order(&symbol, Side::Short, 5.0)
            .await
            .unwrap();
        exchange.set_price(&symbol, 9.0).await;
        let positions = exchange.get_open_positions().await.unwrap();
        assert_relative_eq!(positions[0].unrealized_ror, 10.0);
    }
}
