//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Exchange credentials are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`. Every tunable has a default, so
//! a file containing only the sections you want to override is valid.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::backoff::RetryPolicy;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub scanner: ScannerConfig,
    pub weights: WeightsConfig,
    pub indicators: IndicatorConfig,
    pub backoff: BackoffConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Simulate fills instead of placing real orders.
    pub dry_run: bool,
    pub database_url: String,
    pub scan_interval_secs: u64,
    pub monitor_interval_ms: u64,
    /// Log a performance summary every N scans.
    pub status_every_scans: u64,
    /// Starting quote balance for the paper exchange.
    pub paper_balance: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "APEX-001".to_string(),
            dry_run: true,
            database_url: "sqlite://apex_trader.db".to_string(),
            scan_interval_secs: 60,
            monitor_interval_ms: 1_000,
            status_every_scans: 10,
            paper_balance: 1_000.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub quote_asset: String,
    pub api_key_env: String,
    pub api_secret_env: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.binance.com".to_string(),
            quote_asset: "USDT".to_string(),
            api_key_env: "BINANCE_API_KEY".to_string(),
            api_secret_env: "BINANCE_API_SECRET".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TradingConfig {
    /// Fixed take-profit in percent, used when ATR is unavailable.
    pub take_profit_pct: f64,
    /// Fixed stop-loss in percent, used when ATR is unavailable.
    pub stop_loss_pct: f64,
    pub max_trade_duration_secs: u64,
    /// Fraction of the quote balance committed per trade, in (0, 1].
    pub capital_per_trade: f64,
    pub min_trade_capital: f64,
    pub atr_period: usize,
    pub atr_stop_multiplier: f64,
    pub atr_target_multiplier: f64,
    pub trailing_activation_pct: f64,
    pub trailing_distance_pct: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: 0.5,
            stop_loss_pct: 0.3,
            max_trade_duration_secs: 1_800,
            capital_per_trade: 0.95,
            min_trade_capital: 10.0,
            atr_period: 14,
            atr_stop_multiplier: 2.0,
            atr_target_multiplier: 3.0,
            trailing_activation_pct: 1.0,
            trailing_distance_pct: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskConfig {
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_trades_per_day: u32,
    /// Pause after hitting the consecutive-loss limit.
    pub cooldown_secs: u64,
    /// Pause after hitting the trade-count or daily-loss limit.
    pub limits_pause_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 2.0,
            max_consecutive_losses: 3,
            max_trades_per_day: 20,
            cooldown_secs: 3_600,
            limits_pause_secs: 3_600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScannerConfig {
    pub top_n: usize,
    pub min_score_to_trade: f64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub cache_ttl_secs: u64,
    pub kline_interval: String,
    pub kline_limit: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            top_n: 100,
            min_score_to_trade: 7.0,
            batch_size: 20,
            batch_delay_ms: 100,
            cache_ttl_secs: 30,
            kline_interval: "1m".to_string(),
            kline_limit: 300,
        }
    }
}

/// Composite score weights. Must sum to 1.0 within 0.01.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct WeightsConfig {
    pub volatility: f64,
    pub volume: f64,
    pub momentum: f64,
    pub technical: f64,
    pub risk: f64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            volatility: 0.30,
            volume: 0.25,
            momentum: 0.25,
            technical: 0.15,
            risk: 0.05,
        }
    }
}

impl WeightsConfig {
    pub fn sum(&self) -> f64 {
        self.volatility + self.volume + self.momentum + self.technical + self.risk
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bb_period: usize,
    pub bb_std: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bb_period: 20,
            bb_std: 2.0,
        }
    }
}

/// Retry settings per error class.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BackoffConfig {
    pub transient: PolicyConfig,
    pub persistence: PolicyConfig,
    pub order: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 500,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

impl PolicyConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.max_ms),
            self.jitter,
        )
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Startup configuration failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Check cross-field invariants. Collects every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errs = Vec::new();
        let t = &self.trading;
        let r = &self.risk;
        let s = &self.scanner;
        let ind = &self.indicators;

        let weight_sum = self.weights.sum();
        if (weight_sum - 1.0).abs() > 0.01 {
            errs.push(format!("weights sum to {weight_sum:.3}, expected 1.0 ± 0.01"));
        }
        for (name, w) in [
            ("volatility", self.weights.volatility),
            ("volume", self.weights.volume),
            ("momentum", self.weights.momentum),
            ("technical", self.weights.technical),
            ("risk", self.weights.risk),
        ] {
            if w < 0.0 {
                errs.push(format!("weights.{name} must be non-negative"));
            }
        }

        for (name, pct) in [
            ("trading.take_profit_pct", t.take_profit_pct),
            ("trading.stop_loss_pct", t.stop_loss_pct),
            ("trading.trailing_activation_pct", t.trailing_activation_pct),
            ("trading.trailing_distance_pct", t.trailing_distance_pct),
            ("risk.max_daily_loss_pct", r.max_daily_loss_pct),
        ] {
            if pct <= 0.0 {
                errs.push(format!("{name} must be > 0"));
            }
        }
        if t.stop_loss_pct >= t.take_profit_pct {
            errs.push("trading.stop_loss_pct must be below take_profit_pct".to_string());
        }
        if t.atr_stop_multiplier <= 0.0 || t.atr_target_multiplier <= 0.0 {
            errs.push("trading ATR multipliers must be > 0".to_string());
        }
        if !(t.capital_per_trade > 0.0 && t.capital_per_trade <= 1.0) {
            errs.push(format!(
                "trading.capital_per_trade {} outside (0, 1]",
                t.capital_per_trade
            ));
        }
        if t.min_trade_capital < 0.0 {
            errs.push("trading.min_trade_capital must be non-negative".to_string());
        }
        if t.atr_period == 0 {
            errs.push("trading.atr_period must be > 0".to_string());
        }

        if s.batch_size == 0 {
            errs.push("scanner.batch_size must be > 0".to_string());
        }
        if s.top_n == 0 {
            errs.push("scanner.top_n must be > 0".to_string());
        }
        if s.kline_limit == 0 {
            errs.push("scanner.kline_limit must be > 0".to_string());
        }
        if s.min_score_to_trade < 0.0 {
            errs.push("scanner.min_score_to_trade must be non-negative".to_string());
        }

        if ind.rsi_period == 0 || ind.bb_period == 0 {
            errs.push("indicator periods must be > 0".to_string());
        }
        if ind.macd_fast == 0 || ind.macd_fast >= ind.macd_slow {
            errs.push("indicators.macd_fast must be > 0 and below macd_slow".to_string());
        }
        if ind.rsi_oversold >= ind.rsi_overbought {
            errs.push("indicators.rsi_oversold must be below rsi_overbought".to_string());
        }

        for (name, p) in [
            ("transient", &self.backoff.transient),
            ("persistence", &self.backoff.persistence),
            ("order", &self.backoff.order),
        ] {
            if p.max_attempts == 0 {
                errs.push(format!("backoff.{name}.max_attempts must be > 0"));
            }
            if p.base_ms > p.max_ms {
                errs.push(format!("backoff.{name}.base_ms exceeds max_ms"));
            }
        }

        if self.agent.monitor_interval_ms == 0 {
            errs.push("agent.monitor_interval_ms must be > 0".to_string());
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errs))
        }
    }
}
