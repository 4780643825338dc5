//! Live trading loop
//!
//! One [`CoinTrader`] per traded symbol, driven sequentially by a single
//! polling loop. A symbol with an open position runs the exit state machine;
//! a symbol without one clears its exit state and evaluates entry. Any
//! exchange failure skips that symbol until the next cycle.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{CoinConfig, ConfigError, LiveConfig};
use crate::exchange::{floor_quantity, Balance, Exchange, ExchangeError, PositionInfo};
use crate::exit::{ExitDecision, ExitReason, ExitState, ExitTick, Phase};
use crate::indicators;
use crate::journal::{ClosedTrade, TradeJournal};
use crate::notify::{notify, Notifier, TradeEvent};
use crate::params::StrategyParams;
use crate::registry::ExitRegistry;
use crate::signal;
use crate::types::{Candle, Side, Symbol};

/// Fewer candles than this disables the volatility check for the tick
const MIN_VOLATILITY_CANDLES: usize = 10;

/// Static per-coin trading settings
#[derive(Debug, Clone)]
pub struct CoinTrader {
    pub name: String,
    pub symbol: Symbol,
    pub params: StrategyParams,
    pub leverage: u32,
    pub quantity_precision: u32,
}

impl CoinTrader {
    pub fn from_config(name: &str, coin: &CoinConfig) -> Result<Self, ConfigError> {
        Ok(CoinTrader {
            name: name.to_string(),
            symbol: coin.symbol(),
            params: coin.strategy_params(name)?,
            leverage: coin.leverage,
            quantity_precision: coin.quantity_precision,
        })
    }
}

/// What happened to one symbol during a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleAction {
    /// Entry not attempted
    Skipped(String),
    NoSignal,
    Opened {
        side: Side,
        quantity: f64,
        target_ror: f64,
    },
    Held {
        phase: Phase,
        ror: f64,
        stop_loss_ror: f64,
    },
    Closed {
        reason: ExitReason,
        ror: f64,
    },
    Failed(String),
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub actions: Vec<(Symbol, CycleAction)>,
    pub interrupted: bool,
}

impl CycleReport {
    pub fn failures(&self) -> usize {
        self.actions
            .iter()
            .filter(|(_, a)| matches!(a, CycleAction::Failed(_)))
            .count()
    }
}

/// Candle window and sizing settings used by every coin
#[derive(Debug, Clone)]
pub struct TraderSettings {
    pub timeframe: String,
    pub candle_limit: usize,
    pub volatility_window: usize,
    pub bullet_fraction: f64,
    pub bar_hours: f64,
}

impl From<&LiveConfig> for TraderSettings {
    fn from(live: &LiveConfig) -> Self {
        TraderSettings {
            timeframe: live.timeframe.clone(),
            candle_limit: live.candle_limit,
            volatility_window: live.volatility_window,
            bullet_fraction: live.bullet_fraction,
            bar_hours: live.bar_hours(),
        }
    }
}

pub struct Trader {
    exchange: Arc<dyn Exchange>,
    notifier: Box<dyn Notifier>,
    journal: Option<TradeJournal>,
    registry: ExitRegistry,
    coins: Vec<CoinTrader>,
    settings: TraderSettings,
}

impl Trader {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        notifier: Box<dyn Notifier>,
        journal: Option<TradeJournal>,
        coins: Vec<CoinTrader>,
        settings: TraderSettings,
    ) -> Self {
        Trader {
            exchange,
            notifier,
            journal,
            registry: ExitRegistry::new(),
            coins,
            settings,
        }
    }

    pub fn registry(&self) -> &ExitRegistry {
        &self.registry
    }

    pub fn journal(&self) -> Option<&TradeJournal> {
        self.journal.as_ref()
    }

    /// Poll every `interval` until `cancel` is set
    pub async fn run(&mut self, interval: Duration, cancel: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycle = 0usize;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled(&cancel) => break,
            }

            cycle += 1;
            info!("=== Cycle {} ({}) ===", cycle, Utc::now().format("%Y-%m-%d %H:%M:%S"));
            let report = self.run_cycle(&cancel).await;
            info!(
                symbols = report.actions.len(),
                failures = report.failures(),
                open = self.registry.len(),
                "Cycle finished"
            );

            if report.interrupted || cancel.load(Ordering::SeqCst) {
                break;
            }
        }

        info!("Trading loop stopped after {} cycles", cycle);
    }

    /// One pass over every coin
    pub async fn run_cycle(&mut self, cancel: &AtomicBool) -> CycleReport {
        let mut report = CycleReport::default();

        let balance = match self.exchange.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Balance query failed, skipping cycle: {}", e);
                return report;
            }
        };
        let positions = match self.exchange.get_open_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Position query failed, skipping cycle: {}", e);
                return report;
            }
        };
        info!(
            total = balance.total,
            available = balance.available,
            positions = positions.len(),
            "Account"
        );

        for i in 0..self.coins.len() {
            if cancel.load(Ordering::SeqCst) {
                report.interrupted = true;
                break;
            }
            let coin = self.coins[i].clone();
            let position = positions.iter().find(|p| p.symbol == coin.symbol);

            let result = match position {
                Some(p) => self.manage_exit(&coin, p).await,
                None => {
                    self.registry.remove(&coin.symbol);
                    self.manage_entry(&coin, balance).await
                }
            };

            let action = result.unwrap_or_else(|e| {
                warn!(symbol = %coin.symbol, "Skipping this cycle: {}", e);
                CycleAction::Failed(e.to_string())
            });
            report.actions.push((coin.symbol.clone(), action));
        }

        report
    }

    async fn manage_entry(
        &mut self,
        coin: &CoinTrader,
        balance: Balance,
    ) -> Result<CycleAction, ExchangeError> {
        let bullet = balance.total * self.settings.bullet_fraction;
        if balance.available < bullet || bullet <= 0.0 {
            return Ok(CycleAction::Skipped(format!(
                "available {:.2} below bullet {:.2}",
                balance.available, bullet
            )));
        }

        let candles = self
            .exchange
            .get_candles(&coin.symbol, &self.settings.timeframe, self.settings.candle_limit)
            .await?;
        let decision = signal::evaluate_window(&candles, &coin.params.entry);
        let Some(side) = decision.signal.side() else {
            debug!(symbol = %coin.symbol, candles = candles.len(), "No entry signal");
            return Ok(CycleAction::NoSignal);
        };

        let price = self.exchange.get_price(&coin.symbol).await?;
        if price <= 0.0 {
            return Ok(CycleAction::Skipped(format!("bad price {}", price)));
        }
        let quantity = floor_quantity(bullet / price, coin.quantity_precision);
        if quantity <= 0.0 {
            return Ok(CycleAction::Skipped(format!(
                "quantity rounds to zero at precision {}",
                coin.quantity_precision
            )));
        }

        self.exchange.set_leverage(&coin.symbol, coin.leverage).await?;
        self.exchange
            .place_market_order(&coin.symbol, side, quantity)
            .await?;

        let state = ExitState::open(
            decision.target_ror,
            decision.atr_ratio,
            Utc::now(),
            &coin.params.exit,
        );
        let target_ror = state.target_ror;
        info!(
            symbol = %coin.symbol,
            %side,
            quantity,
            target_ror,
            stop_loss_ror = state.stop_loss_ror,
            "Position opened"
        );
        self.registry.insert(coin.symbol.clone(), state);

        notify(
            self.notifier.as_ref(),
            &TradeEvent::Opened {
                symbol: coin.symbol.clone(),
                side,
                quantity,
                target_ror,
            },
        )
        .await;

        Ok(CycleAction::Opened {
            side,
            quantity,
            target_ror,
        })
    }

    /// Current ATR / price over the volatility window, `None` when unavailable
    async fn current_atr_ratio(&self, coin: &CoinTrader) -> Option<f64> {
        let candles = match self
            .exchange
            .get_candles(
                &coin.symbol,
                &self.settings.timeframe,
                self.settings.volatility_window,
            )
            .await
        {
            Ok(c) => c,
            Err(e) => {
                debug!(symbol = %coin.symbol, "Volatility candles unavailable: {}", e);
                return None;
            }
        };
        atr_ratio(&candles, coin.params.entry.atr_period)
    }

    async fn manage_exit(
        &mut self,
        coin: &CoinTrader,
        position: &PositionInfo,
    ) -> Result<CycleAction, ExchangeError> {
        let atr_ratio = self.current_atr_ratio(coin).await;
        let now = Utc::now();
        let ror = position.unrealized_ror;

        let state = self
            .registry
            .get_or_restore(&coin.symbol, now, &coin.params.exit);
        let elapsed_hours = (now - state.opened_at).num_seconds() as f64 / 3600.0;
        let tick = ExitTick {
            ror,
            atr_ratio,
            elapsed_bars: elapsed_hours / self.settings.bar_hours.max(f64::EPSILON),
        };
        let decision = state.tick(tick, &coin.params.exit);
        let snapshot = state.clone();

        let reason = match decision {
            ExitDecision::Hold => {
                info!(
                    symbol = %coin.symbol,
                    ror,
                    stop_loss_ror = snapshot.stop_loss_ror,
                    highest_ror = snapshot.highest_ror,
                    phase = %snapshot.phase,
                    "Holding"
                );
                return Ok(CycleAction::Held {
                    phase: snapshot.phase,
                    ror,
                    stop_loss_ror: snapshot.stop_loss_ror,
                });
            }
            ExitDecision::Close(reason) => reason,
        };

        info!(symbol = %coin.symbol, ror, %reason, "Closing position");
        self.exchange.close_position(&coin.symbol).await?;

        let balance = match self.exchange.get_balance().await {
            Ok(b) => Some(b.total),
            Err(e) => {
                warn!("Balance after close unavailable: {}", e);
                None
            }
        };
        if let Some(journal) = &self.journal {
            let record = ClosedTrade {
                symbol: coin.symbol.clone(),
                side: position.side,
                size: position.size,
                entry_price: position.entry_price,
                exit_price: position.mark_price,
                ror,
                pnl: position.unrealized_pnl,
                reason: reason.to_string(),
                opened_at: snapshot.opened_at,
                closed_at: Utc::now(),
                balance,
            };
            if let Err(e) = journal.record(&record) {
                warn!("Failed to journal closed trade: {:#}", e);
            }
        }

        notify(
            self.notifier.as_ref(),
            &TradeEvent::Closed {
                symbol: coin.symbol.clone(),
                side: position.side,
                ror,
                pnl: position.unrealized_pnl,
                reason,
            },
        )
        .await;

        self.registry.remove(&coin.symbol);
        Ok(CycleAction::Closed { reason, ror })
    }
}

/// ATR of the window divided by its last close
pub fn atr_ratio(candles: &[Candle], atr_period: usize) -> Option<f64> {
    if candles.len() < MIN_VOLATILITY_CANDLES {
        return None;
    }
    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let period = atr_period.min(candles.len() - 1).max(1);
    let atr = indicators::latest_atr(&high, &low, &close, period)?;
    let last = *close.last()?;
    (last > 0.0).then(|| atr / last)
}

async fn cancelled(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::notify::LogNotifier;
    use chrono::TimeZone;

    fn coin() -> CoinTrader {
        CoinTrader {
            name: "eth".to_string(),
            symbol: Symbol::new("ETHUSDT"),
            params: StrategyParams::default(),
            leverage: 1,
            quantity_precision: 2,
        }
    }

    fn settings() -> TraderSettings {
        TraderSettings::from(&LiveConfig::default())
    }

    fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                Candle::new_unchecked(
                    start + chrono::Duration::hours(4 * i as i64),
                    price,
                    price,
                    price,
                    price,
                    1.0,
                )
            })
            .collect()
    }

    fn trader(paper: Arc<PaperExchange>) -> Trader {
        Trader::new(
            paper,
            Box::new(LogNotifier),
            Some(TradeJournal::in_memory().unwrap()),
            vec![coin()],
            settings(),
        )
    }

    #[tokio::test]
    async fn test_flat_market_opens_nothing() {
        let paper = Arc::new(PaperExchange::new(10_000.0, 0.0));
        let symbol = Symbol::new("ETHUSDT");
        paper.set_candles(&symbol, flat_candles(100, 100.0)).await;

        let mut trader = trader(paper.clone());
        let report = trader.run_cycle(&AtomicBool::new(false)).await;
        assert_eq!(report.actions, vec![(symbol, CycleAction::NoSignal)]);
        assert!(paper.get_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restored_position_hits_stop_and_is_journaled() {
        let paper = Arc::new(PaperExchange::new(10_000.0, 0.0));
        let symbol = Symbol::new("ETHUSDT");
        paper.set_price(&symbol, 100.0).await;
        paper
            .place_market_order(&symbol, Side::Long, 10.0)
            .await
            .unwrap();

        let mut trader = trader(paper.clone());
        let cancel = AtomicBool::new(false);

        // Position discovered without local state: neutral restore, +1% is held
        paper.set_price(&symbol, 101.0).await;
        let report = trader.run_cycle(&cancel).await;
        assert!(matches!(report.actions[0].1, CycleAction::Held { phase: Phase::Initial, .. }));
        assert_eq!(trader.registry().len(), 1);

        // -5% breaches the default -4% stop
        paper.set_price(&symbol, 95.0).await;
        let report = trader.run_cycle(&cancel).await;
        assert!(matches!(
            report.actions[0].1,
            CycleAction::Closed { reason: ExitReason::StopLoss, .. }
        ));
        assert!(trader.registry().is_empty());
        assert!(paper.get_open_positions().await.unwrap().is_empty());

        let journal = trader.journal().unwrap();
        let trades = journal.recent(5).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, "stop loss");
        assert!((trades[0].balance.unwrap() - 9_950.0).abs() < 1e-6);
    }

    /// Paper exchange whose balance endpoint fails once a position was closed
    struct BalanceOutageAfterClose {
        inner: Arc<PaperExchange>,
        closed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Exchange for BalanceOutageAfterClose {
        async fn get_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
            self.inner.get_price(symbol).await
        }

        async fn place_market_order(
            &self,
            symbol: &Symbol,
            side: Side,
            quantity: f64,
        ) -> Result<(), ExchangeError> {
            self.inner.place_market_order(symbol, side, quantity).await
        }

        async fn close_position(&self, symbol: &Symbol) -> Result<(), ExchangeError> {
            self.inner.close_position(symbol).await?;
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn get_open_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
            self.inner.get_open_positions().await
        }

        async fn get_balance(&self) -> Result<Balance, ExchangeError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ExchangeError::Decode("balance unavailable".to_string()));
            }
            self.inner.get_balance().await
        }

        async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError> {
            self.inner.set_leverage(symbol, leverage).await
        }

        async fn get_candles(
            &self,
            symbol: &Symbol,
            timeframe: &str,
            limit: usize,
        ) -> Result<Vec<Candle>, ExchangeError> {
            self.inner.get_candles(symbol, timeframe, limit).await
        }
    }

    #[tokio::test]
    async fn test_close_without_balance_journals_unknown_balance() {
        let paper = Arc::new(PaperExchange::new(10_000.0, 0.0));
        let symbol = Symbol::new("ETHUSDT");
        paper.set_price(&symbol, 100.0).await;
        paper
            .place_market_order(&symbol, Side::Long, 10.0)
            .await
            .unwrap();
        paper.set_price(&symbol, 95.0).await;

        let exchange = Arc::new(BalanceOutageAfterClose {
            inner: paper,
            closed: AtomicBool::new(false),
        });
        let mut trader = Trader::new(
            exchange,
            Box::new(LogNotifier),
            Some(TradeJournal::in_memory().unwrap()),
            vec![coin()],
            settings(),
        );
        let report = trader.run_cycle(&AtomicBool::new(false)).await;
        assert!(matches!(
            report.actions[0].1,
            CycleAction::Closed { reason: ExitReason::StopLoss, .. }
        ));

        let trades = trader.journal().unwrap().recent(5).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].balance, None);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_first_symbol() {
        let paper = Arc::new(PaperExchange::new(1_000.0, 0.0));
        let mut trader = trader(paper);
        let report = trader.run_cycle(&AtomicBool::new(true)).await;
        assert!(report.interrupted);
        assert!(report.actions.is_empty());
    }

    #[tokio::test]
    async fn test_each_symbol_handled_independently() {
        let paper = Arc::new(PaperExchange::new(1_000.0, 0.0));
        let symbol = Symbol::new("ETHUSDT");
        paper.set_price(&symbol, 100.0).await;
        paper.place_market_order(&symbol, Side::Short, 1.0).await.unwrap();

        // Second coin has no position and no candle history
        let mut other = coin();
        other.symbol = Symbol::new("XRPUSDT");
        let mut trader = Trader::new(
            paper,
            Box::new(LogNotifier),
            None,
            vec![coin(), other],
            settings(),
        );
        let report = trader.run_cycle(&AtomicBool::new(false)).await;
        assert_eq!(report.actions.len(), 2);
        assert!(matches!(report.actions[0].1, CycleAction::Held { .. }));
        assert_eq!(report.actions[1].1, CycleAction::NoSignal);
    }

    #[test]
    fn test_atr_ratio_needs_enough_candles() {
        assert!(atr_ratio(&flat_candles(5, 100.0), 14).is_none());
        let ratio = atr_ratio(&flat_candles(20, 100.0), 14).unwrap();
        assert_eq!(ratio, 0.0);
    }
}
