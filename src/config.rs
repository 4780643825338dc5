//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials. Without a config file the built-in
//! defaults apply, including the tuned per-coin parameter table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::backtest::BacktestSettings;
use crate::optimizer::ParamGrid;
use crate::params::{ParamError, StrategyParams};
use crate::types::Symbol;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown coin '{0}'")]
    UnknownCoin(String),

    #[error("data file for {coin} not found: {}", path.display())]
    MissingDataFile { coin: String, path: PathBuf },

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid parameters for {coin}: {source}")]
    Params {
        coin: String,
        #[source]
        source: ParamError,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub backtest: BacktestConfig,
    pub search: SearchConfig,
    pub live: LiveConfig,
    pub coins: BTreeMap<String, CoinConfig>,
    /// Replaces the default stage-1/stage-2 grids when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid: Option<ParamGrid>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            exchange: ExchangeConfig::default(),
            backtest: BacktestConfig::default(),
            search: SearchConfig::default(),
            live: LiveConfig::default(),
            coins: default_coins(),
            grid: None,
        }
    }
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.exchange.load_credentials();
        Ok(config)
    }

    /// Load from `path` when given, otherwise use the built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let mut config = Config::default();
                config.exchange.load_credentials();
                Ok(config)
            }
        }
    }

    pub fn coin(&self, name: &str) -> Result<&CoinConfig, ConfigError> {
        self.coins
            .get(&name.to_lowercase())
            .ok_or_else(|| ConfigError::UnknownCoin(name.to_string()))
    }

    /// Resolve `--coin` into coin names; `all` expands to every configured coin
    pub fn select_coins(&self, selector: &str) -> Result<Vec<String>, ConfigError> {
        if selector.eq_ignore_ascii_case("all") {
            return Ok(self.coins.keys().cloned().collect());
        }
        self.coin(selector)?;
        Ok(vec![selector.to_lowercase()])
    }

    /// Path of a coin's candle file, which must exist
    pub fn data_path(&self, name: &str) -> Result<PathBuf, ConfigError> {
        let coin = self.coin(name)?;
        let path = Path::new(&self.backtest.data_dir).join(&coin.data_file);
        if !path.exists() {
            return Err(ConfigError::MissingDataFile {
                coin: name.to_string(),
                path,
            });
        }
        Ok(path)
    }

    pub fn grid(&self) -> ParamGrid {
        self.grid.clone().unwrap_or_default()
    }

    /// Coins traded by the live loop
    pub fn live_coins(&self) -> Result<Vec<String>, ConfigError> {
        if self.live.coins.is_empty() {
            return Ok(self.coins.keys().cloned().collect());
        }
        self.live
            .coins
            .iter()
            .map(|name| self.coin(name).map(|_| name.to_lowercase()))
            .collect()
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub recv_window_ms: u64,
    pub timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            base_url: "https://fapi.binance.com".to_string(),
            api_key: None,
            api_secret: None,
            recv_window_ms: 5000,
            timeout_secs: 10,
        }
    }
}

impl ExchangeConfig {
    /// Take API credentials from the environment (and `.env`) when set
    pub fn load_credentials(&mut self) {
        dotenv::dotenv().ok();
        if let Ok(api_key) = std::env::var("BINANCE_API_KEY") {
            self.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BINANCE_API_SECRET") {
            self.api_secret = Some(api_secret);
        }
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub data_dir: String,
    #[serde(flatten)]
    pub settings: BacktestSettings,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_dir: ".".to_string(),
            settings: BacktestSettings::default(),
        }
    }
}

/// Grid search, robustness and walk-forward thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Minimum trades for a plain-scored candidate
    pub min_trades: usize,
    /// Entry combinations carried into stage 2
    pub top_k: usize,
    /// Minimum trades per sub-period for robustness scoring
    pub robust_min_trades: usize,
    /// Same, inside walk-forward train windows
    pub walk_forward_min_trades: usize,
    /// Sub-periods with fewer rows are discarded
    pub min_period_rows: usize,
    pub min_train_rows: usize,
    pub min_test_rows: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            min_trades: 30,
            top_k: 3,
            robust_min_trades: 5,
            walk_forward_min_trades: 3,
            min_period_rows: 100,
            min_train_rows: 200,
            min_test_rows: 50,
        }
    }
}

/// Live trading loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub interval_secs: u64,
    pub timeframe: String,
    pub candle_limit: usize,
    /// Candles used for the volatility check on open positions
    pub volatility_window: usize,
    /// Share of total balance committed per entry
    pub bullet_fraction: f64,
    /// Coins to trade; empty means every configured coin
    pub coins: Vec<String>,
    pub journal_path: String,
    pub telegram: Option<TelegramConfig>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        LiveConfig {
            interval_secs: 300,
            timeframe: "4h".to_string(),
            candle_limit: 100,
            volatility_window: 20,
            bullet_fraction: 0.1 * 0.99,
            coins: Vec::new(),
            journal_path: "trades.db".to_string(),
            telegram: None,
        }
    }
}

impl LiveConfig {
    /// Length of one bar of the configured timeframe, in hours
    pub fn bar_hours(&self) -> f64 {
        let tf = self.timeframe.trim();
        let (num, unit) = tf.split_at(tf.len().saturating_sub(1));
        let n: f64 = num.parse().unwrap_or(1.0);
        match unit {
            "m" => n / 60.0,
            "h" => n,
            "d" => n * 24.0,
            "w" => n * 24.0 * 7.0,
            _ => 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

/// One tradable coin: exchange symbol, data file and tuned parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinConfig {
    pub symbol: String,
    pub data_file: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_precision")]
    pub quantity_precision: u32,
    /// Overrides applied on top of the default strategy parameters
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

fn default_leverage() -> u32 {
    1
}

fn default_precision() -> u32 {
    3
}

impl CoinConfig {
    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.symbol)
    }

    pub fn strategy_params(&self, name: &str) -> Result<StrategyParams, ConfigError> {
        StrategyParams::from_overrides(&self.params).map_err(|source| ConfigError::Params {
            coin: name.to_string(),
            source,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn coin(
    name: &str,
    leverage: u32,
    precision: u32,
    ema: (f64, f64),
    rsi: (f64, f64),
    adx: f64,
    atr_mult: f64,
    target: f64,
    trailing: (f64, f64),
) -> (String, CoinConfig) {
    let params = [
        ("ema_short", ema.0),
        ("ema_long", ema.1),
        ("rsi_overbought", rsi.0),
        ("rsi_oversold", rsi.1),
        ("adx_threshold", adx),
        ("atr_multiplier", atr_mult),
        ("target_ror", target),
        ("trailing_ratio", trailing.0),
        ("tight_trailing_ratio", trailing.1),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    (
        name.to_string(),
        CoinConfig {
            symbol: format!("{}USDT", name.to_uppercase()),
            data_file: format!("backtestDatas/{}usdt_4h.csv", name),
            leverage,
            quantity_precision: precision,
            params,
        },
    )
}

/// Built-in coin table with per-coin tuned parameters
pub fn default_coins() -> BTreeMap<String, CoinConfig> {
    [
        coin("eth", 1, 2, (10.0, 30.0), (70.0, 30.0), 15.0, 2.0, 15.0, (0.6, 0.65)),
        coin("btc", 2, 3, (5.0, 20.0), (80.0, 30.0), 30.0, 3.0, 7.0, (0.5, 0.75)),
        coin("sol", 1, 1, (20.0, 50.0), (70.0, 20.0), 25.0, 1.5, 15.0, (0.4, 0.75)),
        coin("bnb", 1, 2, (5.0, 50.0), (70.0, 30.0), 20.0, 1.5, 10.0, (0.4, 0.85)),
        coin("xrp", 1, 0, (10.0, 30.0), (80.0, 30.0), 15.0, 3.0, 15.0, (0.5, 0.85)),
        coin("link", 1, 1, (5.0, 60.0), (70.0, 20.0), 30.0, 1.5, 15.0, (0.7, 0.65)),
        coin("doge", 1, 0, (10.0, 50.0), (80.0, 30.0), 20.0, 2.0, 15.0, (0.4, 0.85)),
        coin("avax", 1, 1, (20.0, 60.0), (80.0, 30.0), 15.0, 1.5, 15.0, (0.4, 0.85)),
        coin("arb", 1, 0, (20.0, 50.0), (80.0, 30.0), 15.0, 1.5, 10.0, (0.4, 0.65)),
        coin("aave", 1, 1, (15.0, 20.0), (80.0, 30.0), 15.0, 3.0, 7.0, (0.4, 0.65)),
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_coin_table_is_valid() {
        let config = Config::default();
        assert_eq!(config.coins.len(), 10);
        for (name, coin) in &config.coins {
            let params = coin.strategy_params(name).unwrap();
            assert!(params.entry.ema_short < params.entry.ema_long);
        }
        let btc = config.coin("BTC").unwrap();
        assert_eq!(btc.symbol, "BTCUSDT");
        assert_eq!(btc.leverage, 2);
    }

    #[test]
    fn test_unknown_coin_is_an_error() {
        let config = Config::default();
        assert!(matches!(
            config.coin("shib"),
            Err(ConfigError::UnknownCoin(_))
        ));
        assert!(config.select_coins("shib").is_err());
        assert_eq!(config.select_coins("all").unwrap().len(), 10);
    }

    #[test]
    fn test_missing_data_file_is_an_error() {
        let mut config = Config::default();
        config.backtest.data_dir = "/nonexistent".to_string();
        assert!(matches!(
            config.data_path("eth"),
            Err(ConfigError::MissingDataFile { .. })
        ));
    }

    #[test]
    fn test_partial_config_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backtest": {{"data_dir": "data", "commission": 0.001}}, "search": {{"min_trades": 10}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.backtest.data_dir, "data");
        assert_eq!(config.backtest.settings.commission, 0.001);
        assert_eq!(config.backtest.settings.initial_cash, 100_000.0);
        assert_eq!(config.search.min_trades, 10);
        assert_eq!(config.search.top_k, 3);
        assert_eq!(config.coins.len(), 10);
    }

    #[test]
    fn test_bar_hours() {
        let mut live = LiveConfig::default();
        assert_eq!(live.bar_hours(), 4.0);
        live.timeframe = "1d".to_string();
        assert_eq!(live.bar_hours(), 24.0);
        live.timeframe = "15m".to_string();
        assert_eq!(live.bar_hours(), 0.25);
    }
}
