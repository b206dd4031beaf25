//! Paper trading.
//!
//! Market data comes from a real exchange; orders fill instantly at the
//! current price against an in-memory book. Nothing is sent upstream.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{Exchange, ExchangeError};
use crate::types::{Fill, PriceSeries, Stats24h};

const PLATFORM_NAME: &str = "paper";

/// Simulated balance sheet.
#[derive(Debug, Default)]
struct PaperBook {
    quote: f64,
    /// Base quantity held, keyed by symbol.
    holdings: HashMap<String, f64>,
}

pub struct PaperExchange {
    inner: Arc<dyn Exchange>,
    quote_asset: String,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(inner: Arc<dyn Exchange>, quote_asset: impl Into<String>, starting_balance: f64) -> Self {
        Self {
            inner,
            quote_asset: quote_asset.into(),
            book: Mutex::new(PaperBook {
                quote: starting_balance,
                holdings: HashMap::new(),
            }),
        }
    }

    pub async fn quote_balance(&self) -> f64 {
        self.book.lock().await.quote
    }

    pub async fn holding(&self, symbol: &str) -> f64 {
        self.book.lock().await.holdings.get(symbol).copied().unwrap_or(0.0)
    }

    async fn fill_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let price = self.inner.get_current_price(symbol).await?;
        if price <= 0.0 {
            return Err(ExchangeError::Parse(format!("{symbol}: non-positive price {price}")));
        }
        Ok(price)
    }
}

fn to_f64(quantity: Decimal) -> Result<f64, ExchangeError> {
    quantity
        .to_f64()
        .filter(|q| *q > 0.0)
        .ok_or_else(|| ExchangeError::Parse(format!("invalid order quantity {quantity}")))
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn list_ranked_symbols(&self, limit: usize) -> Result<Vec<String>, ExchangeError> {
        self.inner.list_ranked_symbols(limit).await
    }

    async fn get_price_window(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<PriceSeries, ExchangeError> {
        self.inner.get_price_window(symbol, interval, limit).await
    }

    async fn get_24h_stats(&self, symbol: &str) -> Result<Stats24h, ExchangeError> {
        self.inner.get_24h_stats(symbol).await
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.inner.get_current_price(symbol).await
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let book = self.book.lock().await;
        if asset == self.quote_asset {
            return Ok(book.quote);
        }
        Ok(book
            .holdings
            .get(&format!("{asset}{}", self.quote_asset))
            .copied()
            .unwrap_or(0.0))
    }

    async fn get_quantity_step(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.inner.get_quantity_step(symbol).await
    }

    async fn place_market_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError> {
        let qty = to_f64(quantity)?;
        let price = self.fill_price(symbol).await?;
        let cost = qty * price;

        let mut book = self.book.lock().await;
        if cost > book.quote + 1e-9 {
            return Err(ExchangeError::InsufficientBalance);
        }
        book.quote -= cost;
        *book.holdings.entry(symbol.to_string()).or_insert(0.0) += qty;
        info!(symbol, price, quantity = qty, balance = book.quote, "Paper buy filled");
        Ok(Fill { price, quantity: qty })
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError> {
        let qty = to_f64(quantity)?;
        let price = self.fill_price(symbol).await?;

        let mut book = self.book.lock().await;
        let held = book.holdings.get(symbol).copied().unwrap_or(0.0);
        if qty > held + 1e-9 {
            return Err(ExchangeError::InsufficientBalance);
        }
        let remaining = held - qty;
        if remaining <= 1e-9 {
            book.holdings.remove(symbol);
        } else {
            book.holdings.insert(symbol.to_string(), remaining);
        }
        book.quote += qty * price;
        info!(symbol, price, quantity = qty, balance = book.quote, "Paper sell filled");
        Ok(Fill { price, quantity: qty })
    }

    fn name(&self) -> &str {
        PLATFORM_NAME
    }
}
