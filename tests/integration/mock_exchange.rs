//! Mock exchange for integration testing.
//!
//! Provides a deterministic `Exchange` implementation: fixed kline windows
//! per symbol, scripted tick prices, a quote balance and an order log. All
//! in-memory with no external dependencies.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use apex_trader::platforms::{Exchange, ExchangeError};
use apex_trader::types::{Bar, Fill, PriceSeries, Stats24h};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub symbol: String,
    pub side: Side,
    pub fill: Fill,
}

/// A mock spot exchange.
///
/// Buys fill at the last close of the symbol's window. Ticks come from the
/// scripted price path, which repeats its last value once exhausted. Sells
/// fill at the last tick observed.
pub struct MockExchange {
    universe: Vec<String>,
    windows: HashMap<String, PriceSeries>,
    stats: HashMap<String, Stats24h>,
    balance: Arc<Mutex<f64>>,
    ticks: Arc<Mutex<HashMap<String, VecDeque<f64>>>>,
    last_tick: Arc<Mutex<HashMap<String, f64>>>,
    orders: Arc<Mutex<Vec<Order>>>,
    /// Number of upcoming sells to reject.
    failing_sells: Arc<Mutex<u32>>,
    /// If set, all operations will return this error.
    force_error: Arc<Mutex<Option<String>>>,
}

impl MockExchange {
    pub fn new(balance: f64) -> Self {
        Self {
            universe: Vec::new(),
            windows: HashMap::new(),
            stats: HashMap::new(),
            balance: Arc::new(Mutex::new(balance)),
            ticks: Arc::new(Mutex::new(HashMap::new())),
            last_tick: Arc::new(Mutex::new(HashMap::new())),
            orders: Arc::new(Mutex::new(Vec::new())),
            failing_sells: Arc::new(Mutex::new(0)),
            force_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Add a symbol to the universe with a kline window and 24h stats.
    pub fn with_instrument(mut self, window: PriceSeries, stats: Stats24h) -> Self {
        let symbol = window.symbol.clone();
        self.universe.push(symbol.clone());
        self.windows.insert(symbol.clone(), window);
        self.stats.insert(symbol, stats);
        self
    }

    /// Add a symbol to the universe that has no market data.
    pub fn with_broken_symbol(mut self, symbol: &str) -> Self {
        self.universe.push(symbol.to_string());
        self
    }

    /// Replace the tick path for `symbol`.
    pub fn script_prices(&self, symbol: &str, prices: &[f64]) {
        self.ticks
            .lock()
            .unwrap()
            .insert(symbol.to_string(), prices.iter().copied().collect());
    }

    pub fn fail_next_sells(&self, n: u32) {
        *self.failing_sells.lock().unwrap() = n;
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.lock().unwrap().clone()
    }

    pub fn balance(&self) -> f64 {
        *self.balance.lock().unwrap()
    }

    fn check_error(&self) -> Result<(), ExchangeError> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(msg) => Err(ExchangeError::Network(msg.clone())),
            None => Ok(()),
        }
    }

    fn reference_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.windows
            .get(symbol)
            .and_then(|w| w.last_close())
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    fn record(&self, symbol: &str, side: Side, fill: Fill) {
        self.orders.lock().unwrap().push(Order {
            symbol: symbol.to_string(),
            side,
            fill,
        });
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn list_ranked_symbols(&self, limit: usize) -> Result<Vec<String>, ExchangeError> {
        self.check_error()?;
        Ok(self.universe.iter().take(limit).cloned().collect())
    }

    async fn get_price_window(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> Result<PriceSeries, ExchangeError> {
        self.check_error()?;
        self.windows
            .get(symbol)
            .map(|w| w.tail(limit))
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_24h_stats(&self, symbol: &str) -> Result<Stats24h, ExchangeError> {
        self.check_error()?;
        self.stats
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.check_error()?;
        let scripted = {
            let mut ticks = self.ticks.lock().unwrap();
            ticks.get_mut(symbol).and_then(|path| {
                if path.len() > 1 {
                    path.pop_front()
                } else {
                    path.front().copied()
                }
            })
        };
        let price = match scripted {
            Some(p) => p,
            None => self.reference_price(symbol)?,
        };
        self.last_tick.lock().unwrap().insert(symbol.to_string(), price);
        Ok(price)
    }

    async fn get_balance(&self, _asset: &str) -> Result<f64, ExchangeError> {
        self.check_error()?;
        Ok(self.balance())
    }

    async fn get_quantity_step(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        self.check_error()?;
        Ok(dec!(0.001))
    }

    async fn place_market_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError> {
        self.check_error()?;
        let price = self.reference_price(symbol)?;
        let qty = quantity.to_f64().unwrap_or(0.0);
        {
            let mut balance = self.balance.lock().unwrap();
            if qty * price > *balance + 1e-9 {
                return Err(ExchangeError::InsufficientBalance);
            }
            *balance -= qty * price;
        }
        let fill = Fill { price, quantity: qty };
        self.record(symbol, Side::Buy, fill);
        Ok(fill)
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<Fill, ExchangeError> {
        self.check_error()?;
        {
            let mut failing = self.failing_sells.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(ExchangeError::Network("sell rejected by mock".to_string()));
            }
        }
        let price = match self.last_tick.lock().unwrap().get(symbol).copied() {
            Some(p) => p,
            None => self.reference_price(symbol)?,
        };
        let qty = quantity.to_f64().unwrap_or(0.0);
        *self.balance.lock().unwrap() += qty * price;
        let fill = Fill { price, quantity: qty };
        self.record(symbol, Side::Sell, fill);
        Ok(fill)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Flat closes at `price` with a one-unit high/low range: ATR is exactly 1.
pub fn unit_atr_window(symbol: &str, price: f64, bars: usize) -> PriceSeries {
    let mut series = PriceSeries::new(symbol);
    let start = Utc::now() - Duration::minutes(bars as i64);
    for i in 0..bars {
        series.push(Bar {
            open_time: start + Duration::minutes(i as i64),
            high: price + 0.5,
            low: price - 0.5,
            close: price,
        });
    }
    series
}

pub fn liquid_stats() -> Stats24h {
    Stats24h {
        quote_volume: 250_000_000.0,
        price_change_percent: 2.5,
        high: 104.0,
        low: 97.0,
        trade_count: 400_000,
    }
}
