use serde::Deserialize;

use crate::{MarketSpec, TradingMode};

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Exchange credentials (required in live mode only)
    pub dydx_api_key: String,
    pub dydx_api_secret: String,
    pub dydx_passphrase: String,

    // Trading
    pub trading_mode: TradingMode,
    pub paper_balance_usd: f64,
    pub paper_slippage_bps: f64,

    // Files
    pub markets_config_path: String,
    pub journal_path: String,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let trading_mode = match required_env("TRADING_MODE").to_lowercase().as_str() {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            other => panic!("ERROR: TRADING_MODE must be 'paper' or 'live', got: '{other}'"),
        };

        // Credentials are only required when orders go to the real exchange.
        let credential = |key: &str| match trading_mode {
            TradingMode::Live => required_env(key),
            TradingMode::Paper => optional_env(key).unwrap_or_default(),
        };

        Config {
            dydx_api_key: credential("DYDX_API_KEY"),
            dydx_api_secret: credential("DYDX_API_SECRET"),
            dydx_passphrase: credential("DYDX_PASSPHRASE"),
            trading_mode,
            paper_balance_usd: optional_env("PAPER_BALANCE_USD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000.0),
            paper_slippage_bps: optional_env("PAPER_SLIPPAGE_BPS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10.0),
            markets_config_path: optional_env("MARKETS_CONFIG_PATH")
                .unwrap_or_else(|| "config/markets.toml".to_string()),
            journal_path: optional_env("JOURNAL_PATH")
                .unwrap_or_else(|| "trade_history.log".to_string()),
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ─── Markets file ─────────────────────────────────────────────────────────────

/// Top-level markets/engine config file (TOML).
///
/// Example `config/markets.toml`:
/// ```toml
/// [engine]
/// lookback = 2
/// allocation_fraction = 0.98
/// default_drop_threshold = 0.015
///
/// [[market]]
/// symbol = "BTC-USD"
/// drop_threshold = 0.010
/// step_size = 0.0001
/// min_order_size = 0.001
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct MarketsFileConfig {
    pub engine: EngineSettings,
    #[serde(rename = "market")]
    pub markets: Vec<MarketEntry>,
}

/// Engine-wide settings from the `[engine]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Evaluation window in candles; the reference close is the oldest
    /// candle of the window. Minimum 2.
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    /// Share of free balance committed to a new position.
    #[serde(default = "default_allocation_fraction")]
    pub allocation_fraction: f64,
    /// Threshold applied to markets that omit their own.
    #[serde(default = "default_drop_threshold")]
    pub default_drop_threshold: f64,
    /// Candles whose latest open time is older than this are skipped.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Delay after the hour boundary before the tick runs, letting the
    /// hourly candle finalize on the exchange side.
    #[serde(default = "default_tick_delay_secs")]
    pub tick_delay_secs: u64,
    /// Consecutive gateway-failure ticks tolerated before a fatal stop.
    #[serde(default = "default_max_gateway_failures")]
    pub max_gateway_failures: u32,
    /// Bounded wait for an order fill confirmation.
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
}

fn default_lookback() -> usize {
    2
}
fn default_allocation_fraction() -> f64 {
    0.98
}
fn default_drop_threshold() -> f64 {
    0.015
}
fn default_stale_after_secs() -> u64 {
    7200
}
fn default_tick_delay_secs() -> u64 {
    45
}
fn default_max_gateway_failures() -> u32 {
    3
}
fn default_order_timeout_secs() -> u64 {
    30
}

/// One `[[market]]` entry. `drop_threshold` falls back to the engine-wide
/// default when omitted.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketEntry {
    pub symbol: String,
    pub drop_threshold: Option<f64>,
    pub step_size: f64,
    pub min_order_size: f64,
}

impl MarketsFileConfig {
    /// Load from a TOML file. Panics on read, parse, or validation errors;
    /// a malformed markets file must never reach the trading loop.
    pub fn load(path: &str) -> Self {
        let content = std::fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("Failed to read markets config at '{path}': {e}"));
        let config: MarketsFileConfig = toml::from_str(&content)
            .unwrap_or_else(|e| panic!("Failed to parse markets config at '{path}': {e}"));
        config.validate(path);
        config
    }

    fn validate(&self, path: &str) {
        let engine = &self.engine;
        if engine.lookback < 2 {
            panic!("'{path}': engine.lookback must be >= 2, got {}", engine.lookback);
        }
        if !(engine.allocation_fraction > 0.0 && engine.allocation_fraction <= 1.0) {
            panic!(
                "'{path}': engine.allocation_fraction must be in (0, 1], got {}",
                engine.allocation_fraction
            );
        }
        if self.markets.is_empty() {
            panic!("'{path}': at least one [[market]] entry is required");
        }
        for market in &self.markets {
            if market.step_size <= 0.0 || market.min_order_size <= 0.0 {
                panic!(
                    "'{path}': market '{}' must have positive step_size and min_order_size",
                    market.symbol
                );
            }
        }
    }

    /// Markets in file order with thresholds resolved; the list order is
    /// the fixed enumeration order for the process lifetime.
    pub fn resolved_markets(&self) -> Vec<MarketSpec> {
        self.markets
            .iter()
            .map(|entry| MarketSpec {
                symbol: entry.symbol.clone(),
                drop_threshold: entry
                    .drop_threshold
                    .unwrap_or(self.engine.default_drop_threshold),
                step_size: entry.step_size,
                min_order_size: entry.min_order_size,
            })
            .collect()
    }
}
