//! Configuration management
//!
//! Handles loading and parsing of the JSON bot configuration with environment
//! variable support for API credentials.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TradingError;
use crate::{Money, ProductId};

/// Portions must add up to one within this tolerance
pub const PORTION_TOLERANCE: f64 = 0.001;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub bot: BotConfig,
    pub assets: Vec<AssetConfig>,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // Load API credentials from environment if not set
        if let Ok(api_key) = std::env::var("COINBASE_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("COINBASE_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }

        Ok(config)
    }

    /// Check every asset and reject duplicate product ids
    pub fn validate(&self) -> Result<(), TradingError> {
        if self.assets.is_empty() {
            return Err(TradingError::Config("no assets configured".to_string()));
        }

        let mut seen = HashSet::new();
        for asset in &self.assets {
            asset.validate()?;
            if !seen.insert(asset.product_id.as_str()) {
                return Err(TradingError::Config(format!(
                    "duplicate product id {}",
                    asset.product_id
                )));
            }
        }
        Ok(())
    }

    /// Look up one asset by product id
    pub fn asset(&self, product_id: &str) -> Option<&AssetConfig> {
        self.assets
            .iter()
            .find(|a| a.product_id.as_str().eq_ignore_ascii_case(product_id))
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum spacing between consecutive requests
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
}

fn default_base_url() -> String {
    "https://api.coinbase.com".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_min_request_interval_ms() -> u64 {
    100
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            min_request_interval_ms: default_min_request_interval_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
        }
    }
}

impl ExchangeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}

/// Where the bot keeps its files and where it reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Directory holding one state file per asset plus the run lock
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Optional HTTP endpoint receiving every trade event as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// SQLite trade journal; disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,
}

impl Default for BotConfig {
    fn default() -> Self {
        BotConfig {
            state_dir: PathBuf::from("state"),
            log_dir: PathBuf::from("logs"),
            webhook_url: None,
            journal_path: Some(PathBuf::from("state/journal.db")),
        }
    }
}

/// Candle width used to build the RSI series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    OneMinute,
    FiveMinute,
    FifteenMinute,
    ThirtyMinute,
    OneHour,
    TwoHour,
    SixHour,
    OneDay,
}

impl Granularity {
    pub fn seconds(self) -> i64 {
        match self {
            Granularity::OneMinute => 60,
            Granularity::FiveMinute => 300,
            Granularity::FifteenMinute => 900,
            Granularity::ThirtyMinute => 1_800,
            Granularity::OneHour => 3_600,
            Granularity::TwoHour => 7_200,
            Granularity::SixHour => 21_600,
            Granularity::OneDay => 86_400,
        }
    }

    /// Wire name used by the candles endpoint
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::OneMinute => "ONE_MINUTE",
            Granularity::FiveMinute => "FIVE_MINUTE",
            Granularity::FifteenMinute => "FIFTEEN_MINUTE",
            Granularity::ThirtyMinute => "THIRTY_MINUTE",
            Granularity::OneHour => "ONE_HOUR",
            Granularity::TwoHour => "TWO_HOUR",
            Granularity::SixHour => "SIX_HOUR",
            Granularity::OneDay => "ONE_DAY",
        }
    }
}

impl Default for Granularity {
    fn default() -> Self {
        Granularity::FifteenMinute
    }
}

/// One take-profit tier: sell `portion` of the fill at `profit_pct` percent above it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitTier {
    /// Percent, so 4 means +4%
    pub profit_pct: Money,
    /// Fraction of the filled quantity, 0 < portion <= 1
    pub portion: Money,
}

impl ExitTier {
    pub fn new(profit_pct: Money, portion: Money) -> Self {
        ExitTier { profit_pct, portion }
    }
}

/// Per-product strategy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    pub product_id: ProductId,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_rsi_threshold")]
    pub rsi_threshold: f64,
    /// Quote currency spent on every entry
    pub quote_spend: Money,
    #[serde(default = "default_exit_tiers")]
    pub exit_tiers: Vec<ExitTier>,
    #[serde(default)]
    pub candle_granularity: Granularity,
    /// Cancel an unfilled entry after this many minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_timeout_minutes: Option<i64>,
}

fn default_rsi_period() -> usize {
    14
}

fn default_rsi_threshold() -> f64 {
    30.0
}

fn default_exit_tiers() -> Vec<ExitTier> {
    let third = Money::ONE / Money::from_i64(3);
    vec![
        ExitTier::new(Money::from_i64(1), third),
        ExitTier::new(Money::from_i64(4), third),
        ExitTier::new(Money::from_i64(7), Money::ONE - third - third),
    ]
}

impl AssetConfig {
    /// Config with the stock tiers (+1%, +4%, +7% in thirds)
    pub fn new(product_id: impl AsRef<str>, quote_spend: Money) -> Self {
        AssetConfig {
            product_id: ProductId::new(product_id),
            rsi_period: default_rsi_period(),
            rsi_threshold: default_rsi_threshold(),
            quote_spend,
            exit_tiers: default_exit_tiers(),
            candle_granularity: Granularity::default(),
            entry_timeout_minutes: None,
        }
    }

    pub fn validate(&self) -> Result<(), TradingError> {
        let id = self.product_id.as_str();
        let fail = |msg: String| Err(TradingError::Config(format!("[{}] {}", id, msg)));

        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return fail("product id must be non-empty and use only letters, digits, '-' or '_'".into());
        }
        if self.rsi_period == 0 {
            return fail("rsi_period must be positive".into());
        }
        if !(0.0..=100.0).contains(&self.rsi_threshold) {
            return fail(format!("rsi_threshold {} outside 0..=100", self.rsi_threshold));
        }
        if !self.quote_spend.is_positive() {
            return fail(format!("quote_spend {} must be positive", self.quote_spend));
        }
        if self.exit_tiers.is_empty() {
            return fail("at least one exit tier is required".into());
        }
        for (i, tier) in self.exit_tiers.iter().enumerate() {
            if !tier.profit_pct.is_positive() {
                return fail(format!("tier {} profit_pct must be positive", i));
            }
            if !tier.portion.is_positive() || tier.portion > Money::ONE {
                return fail(format!("tier {} portion must be in (0, 1]", i));
            }
        }
        let total: Money = self.exit_tiers.iter().map(|t| t.portion).sum();
        if (total.to_f64() - 1.0).abs() > PORTION_TOLERANCE {
            return fail(format!("tier portions sum to {}, expected 1", total));
        }
        if let Some(minutes) = self.entry_timeout_minutes {
            if minutes <= 0 {
                return fail("entry_timeout_minutes must be positive".into());
            }
        }
        Ok(())
    }
}
