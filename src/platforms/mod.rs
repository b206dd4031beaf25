//! Exchange integrations.
//!
//! Defines the `Exchange` trait and provides implementations for:
//! - Binance spot REST, signed for account and order endpoints
//! - Paper trading, which prices fills from live market data and keeps an
//!   in-memory balance for dry runs

pub mod binance;
pub mod paper;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{Fill, PriceSeries, Stats24h};

/// Errors surfaced by an exchange adapter. None are fatal on their own.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Exchange API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Whether repeating the same call might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited(_) => true,
            Self::Api { code, .. } => matches!(code, -1000 | -1001 | -1003 | -1015 | -1016),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ExchangeError::Parse(e.to_string())
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}

/// Abstraction over a spot exchange.
///
/// Market-data calls are read-only; order calls place MARKET orders and
/// report the average fill.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Top `limit` symbols by 24h quote volume, highest first.
    async fn list_ranked_symbols(&self, limit: usize) -> Result<Vec<String>, ExchangeError>;

    /// Most recent `limit` bars at `interval`, oldest first.
    async fn get_price_window(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<PriceSeries, ExchangeError>;

    async fn get_24h_stats(&self, symbol: &str) -> Result<Stats24h, ExchangeError>;

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Free balance of `asset`.
    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError>;

    /// Lot-size step for order quantities.
    async fn get_quantity_step(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn place_market_buy(&self, symbol: &str, quantity: Decimal)
        -> Result<Fill, ExchangeError>;

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError>;

    /// Exchange name for logging and identification.
    fn name(&self) -> &str;
}
