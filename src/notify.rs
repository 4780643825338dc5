//! Trade event notifications
//!
//! Delivery is best effort: a failed notification is logged and never
//! interrupts trading.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::TelegramConfig;
use crate::exit::ExitReason;
use crate::types::{Side, Symbol};

#[derive(Debug, Clone, PartialEq)]
pub enum TradeEvent {
    Opened {
        symbol: Symbol,
        side: Side,
        quantity: f64,
        target_ror: f64,
    },
    Closed {
        symbol: Symbol,
        side: Side,
        ror: f64,
        pnl: f64,
        reason: ExitReason,
    },
}

impl std::fmt::Display for TradeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeEvent::Opened {
                symbol,
                side,
                quantity,
                target_ror,
            } => write!(
                f,
                "✅ {} {} opened | qty:{} | target:{:.1}%",
                symbol,
                side.to_string().to_uppercase(),
                quantity,
                target_ror
            ),
            TradeEvent::Closed {
                symbol,
                side,
                ror,
                pnl,
                reason,
            } => write!(
                f,
                "🔴 {} {} closed ({}) | ROR:{:.1}% | PnL:{:.2}$",
                symbol,
                side.to_string().to_uppercase(),
                reason,
                ror,
                pnl
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event: &TradeEvent) -> Result<()>;
}

/// Send and swallow failures
pub async fn notify(notifier: &dyn Notifier, event: &TradeEvent) {
    if let Err(e) = notifier.send(event).await {
        warn!("Notification failed: {:#}", e);
    }
}

/// Writes events to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, event: &TradeEvent) -> Result<()> {
        info!("{}", event);
        Ok(())
    }
}

/// Telegram Bot API `sendMessage`
pub struct TelegramNotifier {
    client: Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(TelegramNotifier {
            client,
            url: format!("https://api.telegram.org/bot{}/sendMessage", config.bot_token),
            chat_id: config.chat_id.clone(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, event: &TradeEvent) -> Result<()> {
        info!("{}", event);
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": event.to_string(),
            }))
            .send()
            .await
            .context("Failed to reach Telegram")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram API error {}: {}", status, body);
        }
        Ok(())
    }
}

/// Telegram when configured, log otherwise
pub fn from_config(telegram: Option<&TelegramConfig>) -> Result<Box<dyn Notifier>> {
    match telegram {
        Some(cfg) => Ok(Box::new(TelegramNotifier::new(cfg)?)),
        None => Ok(Box::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _event: &TradeEvent) -> Result<()> {
            anyhow::bail!("offline")
        }
    }

    #[test]
    fn test_event_messages() {
        let opened = TradeEvent::Opened {
            symbol: Symbol::new("ETHUSDT"),
            side: Side::Long,
            quantity: 0.25,
            target_ror: 8.04,
        };
        assert_eq!(opened.to_string(), "✅ ETHUSDT LONG opened | qty:0.25 | target:8.0%");

        let closed = TradeEvent::Closed {
            symbol: Symbol::new("SOLUSDT"),
            side: Side::Short,
            ror: -4.2,
            pnl: -12.5,
            reason: ExitReason::StopLoss,
        };
        assert_eq!(
            closed.to_string(),
            "🔴 SOLUSDT SHORT closed (stop loss) | ROR:-4.2% | PnL:-12.50$"
        );
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let event = TradeEvent::Opened {
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Long,
            quantity: 0.001,
            target_ror: 7.0,
        };
        notify(&FailingNotifier, &event).await;
        notify(&LogNotifier, &event).await;
    }
}
