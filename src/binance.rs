//! Binance USDⓈ-M futures REST adapter
//!
//! Public endpoints (price, klines) need no credentials. Account endpoints
//! are signed with HMAC-SHA256 over the query string and sent with the
//! `X-MBX-APIKEY` header.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::exchange::{floor_quantity, margin_ror, Balance, Exchange, ExchangeError, PositionInfo};
use crate::types::{Candle, Side, Symbol};

type HmacSha256 = Hmac<Sha256>;

/// Maximum klines per request
const MAX_KLINES_PER_REQUEST: usize = 1500;

/// Hex HMAC-SHA256 of `payload` keyed with `secret`
pub fn sign_query(payload: &str, secret: &str) -> Result<String, ExchangeError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ExchangeError::Signing)?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Parse one kline row: `[open_time, open, high, low, close, volume, ...]`
pub fn parse_kline(raw: &[serde_json::Value]) -> Option<Candle> {
    if raw.len() < 6 {
        return None;
    }
    let num = |i: usize| -> Option<f64> { raw[i].as_str()?.parse().ok() };
    let datetime = DateTime::<Utc>::from_timestamp_millis(raw[0].as_i64()?)?;
    Candle::new(datetime, num(1)?, num(2)?, num(3)?, num(4)?, num(5)?).ok()
}

fn side_param(side: Side) -> &'static str {
    match side {
        Side::Long => "BUY",
        Side::Short => "SELL",
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetBalance {
    asset: String,
    balance: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
    leverage: String,
}

fn parse_f64(field: &str, value: &str) -> Result<f64, ExchangeError> {
    value
        .parse()
        .map_err(|_| ExchangeError::Decode(format!("{} is not a number: {}", field, value)))
}

impl PositionRisk {
    fn into_info(self) -> Result<Option<PositionInfo>, ExchangeError> {
        let amount = parse_f64("positionAmt", &self.position_amt)?;
        if amount == 0.0 {
            return Ok(None);
        }
        let size = amount.abs();
        let entry_price = parse_f64("entryPrice", &self.entry_price)?;
        let pnl = parse_f64("unRealizedProfit", &self.unrealized_profit)?;
        let leverage: u32 = self.leverage.parse().unwrap_or(1);

        Ok(Some(PositionInfo {
            symbol: Symbol::new(&self.symbol),
            side: if amount > 0.0 { Side::Long } else { Side::Short },
            size,
            entry_price,
            mark_price: parse_f64("markPrice", &self.mark_price)?,
            unrealized_pnl: pnl,
            unrealized_ror: margin_ror(pnl, size, entry_price, leverage),
        }))
    }
}

/// Binance futures client
pub struct BinanceFutures {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    recv_window_ms: u64,
    /// Quantity precision per symbol, used when flattening positions
    precision: Mutex<HashMap<Symbol, u32>>,
}

impl BinanceFutures {
    pub fn new(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(BinanceFutures {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            recv_window_ms: config.recv_window_ms,
            precision: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }

    /// Remember the quantity precision of `symbol`
    pub fn set_precision(&self, symbol: &Symbol, precision: u32) {
        if let Ok(mut map) = self.precision.lock() {
            map.insert(symbol.clone(), precision);
        }
    }

    fn precision_of(&self, symbol: &Symbol) -> Option<u32> {
        self.precision.lock().ok()?.get(symbol).copied()
    }

    async fn check(response: Response) -> Result<Response, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExchangeError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn public_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} {:?}", url, params);
        let response = self.client.get(&url).query(params).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn signed<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let (Some(key), Some(secret)) = (&self.api_key, &self.api_secret) else {
            return Err(ExchangeError::MissingCredentials);
        };

        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query.push(format!("recvWindow={}", self.recv_window_ms));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");
        let signature = sign_query(&query, secret)?;

        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        debug!("{} {} ({} params)", method, path, params.len());
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", key)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<(), ExchangeError> {
        let qty = match self.precision_of(symbol) {
            Some(p) => floor_quantity(quantity, p),
            None => quantity,
        };
        if qty <= 0.0 {
            return Err(ExchangeError::InvalidQuantity(quantity));
        }

        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side_param(side).to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", qty.to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let _: serde_json::Value = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        info!(%symbol, side = side_param(side), quantity = qty, reduce_only, "Order submitted");
        Ok(())
    }
}

#[async_trait]
impl Exchange for BinanceFutures {
    async fn get_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        let ticker: TickerPrice = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        parse_f64("price", &ticker.price)
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
    ) -> Result<(), ExchangeError> {
        self.order(symbol, side, quantity, false).await
    }

    async fn close_position(&self, symbol: &Symbol) -> Result<(), ExchangeError> {
        let positions = self.get_open_positions().await?;
        let position = positions
            .into_iter()
            .find(|p| &p.symbol == symbol)
            .ok_or_else(|| ExchangeError::NoPosition(symbol.clone()))?;
        self.order(symbol, position.side.opposite(), position.size, true)
            .await
    }

    async fn get_open_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
        let raw: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", &[])
            .await?;
        let mut positions = Vec::new();
        for row in raw {
            if let Some(info) = row.into_info()? {
                positions.push(info);
            }
        }
        Ok(positions)
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        let assets: Vec<AssetBalance> = self.signed(Method::GET, "/fapi/v2/balance", &[]).await?;
        match assets.into_iter().find(|a| a.asset == "USDT") {
            Some(usdt) => Ok(Balance {
                total: parse_f64("balance", &usdt.balance)?,
                available: parse_f64("availableBalance", &usdt.available_balance)?,
            }),
            None => {
                warn!("No USDT balance reported");
                Ok(Balance::default())
            }
        }
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("leverage", leverage.max(1).to_string()),
        ];
        let _: serde_json::Value = self
            .signed(Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        Ok(())
    }

    async fn get_candles(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", timeframe.to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<Vec<serde_json::Value>> = self.public_get("/fapi/v1/klines", &params).await?;
        let candles: Vec<Candle> = rows.iter().filter_map(|row| parse_kline(row)).collect();
        if candles.len() < rows.len() {
            warn!(
                %symbol,
                dropped = rows.len() - candles.len(),
                "Dropped malformed klines"
            );
        }
        Ok(candles)
    }
}
