//! Shared types for the APEX trader.
//!
//! These types form the data model used across all modules. Indicator,
//! scoring, engine and storage code all depend on this file and never on
//! each other's internals.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// One OHLC bar as returned by the exchange kline endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Ordered price history for one instrument, oldest first.
///
/// Lives only for the duration of a scan (or inside an [`Opportunity`]);
/// never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub symbol: String,
    pub bars: Vec<Bar>,
}

impl PriceSeries {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bars: Vec::new(),
        }
    }

    /// Build a series from closes only; highs and lows equal the close.
    pub fn from_closes(symbol: impl Into<String>, closes: &[f64]) -> Self {
        let start = Utc::now() - chrono::Duration::minutes(closes.len() as i64);
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                open_time: start + chrono::Duration::minutes(i as i64),
                high: c,
                low: c,
                close: c,
            })
            .collect();
        Self {
            symbol: symbol.into(),
            bars,
        }
    }

    pub fn push(&mut self, bar: Bar) {
        self.bars.push(bar);
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }

    /// The most recent `n` bars as a new series.
    pub fn tail(&self, n: usize) -> Self {
        let start = self.bars.len().saturating_sub(n);
        Self {
            symbol: self.symbol.clone(),
            bars: self.bars[start..].to_vec(),
        }
    }
}

/// Rolling 24-hour ticker statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats24h {
    /// Volume in the quote asset (USDT for USDT pairs).
    pub quote_volume: f64,
    pub price_change_percent: f64,
    pub high: f64,
    pub low: f64,
    pub trade_count: u64,
}

/// Result of a market order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Average fill price.
    pub price: f64,
    pub quantity: f64,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// EMA50/EMA200 trend classification. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Bullish => write!(f, "BULLISH"),
            Trend::Bearish => write!(f, "BEARISH"),
            Trend::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// The five bounded sub-scores, each in [0, 10].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub volatility: f64,
    pub volume: f64,
    pub momentum: f64,
    pub technical: f64,
    pub risk: f64,
}

impl fmt::Display for SubScores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vol={:.1} volu={:.1} mom={:.1} tech={:.1} risk={:.1}",
            self.volatility, self.volume, self.momentum, self.technical, self.risk,
        )
    }
}

/// A scored instrument. Immutable once produced by the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentScore {
    pub symbol: String,
    /// Weighted composite in [0, 10].
    pub composite: f64,
    pub sub_scores: SubScores,
    pub price: f64,
    pub trend: Trend,
}

impl fmt::Display for InstrumentScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} score={:.2}/10 @ {:.6} [{}] ({})",
            self.symbol, self.composite, self.price, self.trend, self.sub_scores,
        )
    }
}

/// A scored, not-yet-acted-upon candidate produced by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub score: InstrumentScore,
    /// Recent bars, used for ATR at entry.
    pub window: PriceSeries,
}

impl Opportunity {
    pub fn symbol(&self) -> &str {
        &self.score.symbol
    }

    pub fn current_price(&self) -> f64 {
        self.score.price
    }
}

// ---------------------------------------------------------------------------
// Position & trade record
// ---------------------------------------------------------------------------

/// How a position's stop and target were derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelMode {
    /// ATR-scaled stop and target.
    Atr,
    /// Fixed-percentage fallback (insufficient history for ATR).
    Fixed,
}

impl fmt::Display for LevelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelMode::Atr => write!(f, "ATR"),
            LevelMode::Fixed => write!(f, "FIXED"),
        }
    }
}

impl std::str::FromStr for LevelMode {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ATR" => Ok(LevelMode::Atr),
            "FIXED" => Ok(LevelMode::Fixed),
            other => Err(TradeError::Persistence(format!("unknown level mode: {other}"))),
        }
    }
}

/// The single open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    /// Ledger row id. `None` until the entry has been recorded.
    pub trade_id: Option<i64>,
    pub symbol: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub high_water_mark: f64,
    pub trailing_active: bool,
    pub level_mode: LevelMode,
    pub entry_score: f64,
    pub sub_scores: SubScores,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} qty={} entry={:.6} stop={:.6} target={:.6} hwm={:.6}{}",
            self.symbol,
            self.quantity,
            self.entry_price,
            self.stop_loss,
            self.take_profit,
            self.high_water_mark,
            if self.trailing_active { " [trailing]" } else { "" },
        )
    }
}

impl Position {
    /// Unrealized P&L in percent at `price`.
    pub fn profit_percent(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }

    /// Unrealized P&L in quote currency at `price`.
    pub fn profit_usd(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity
    }

    /// Time held as of `now`.
    pub fn held_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.entry_time
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    MaxDuration,
    Shutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::MaxDuration => "MAX_DURATION",
            ExitReason::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExitReason {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TAKE_PROFIT" => Ok(ExitReason::TakeProfit),
            "STOP_LOSS" => Ok(ExitReason::StopLoss),
            "TRAILING_STOP" => Ok(ExitReason::TrailingStop),
            "MAX_DURATION" => Ok(ExitReason::MaxDuration),
            "SHUTDOWN" => Ok(ExitReason::Shutdown),
            other => Err(TradeError::Persistence(format!("unknown exit reason: {other}"))),
        }
    }
}

/// An archived position. Created only when a position closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position: Position,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub profit_percent: f64,
    pub profit_usd: f64,
    pub duration_seconds: i64,
}

impl TradeRecord {
    /// Archive `position` at the given exit fill.
    pub fn close(
        position: Position,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        exit_reason: ExitReason,
    ) -> Self {
        let profit_percent = position.profit_percent(exit_price);
        let profit_usd = position.profit_usd(exit_price);
        let duration_seconds = position.held_for(exit_time).num_seconds().max(0);
        Self {
            position,
            exit_price,
            exit_time,
            exit_reason,
            profit_percent,
            profit_usd,
            duration_seconds,
        }
    }

    pub fn is_win(&self) -> bool {
        self.profit_percent > 0.0
    }

    pub fn is_loss(&self) -> bool {
        self.profit_percent < 0.0
    }
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} entry={:.6} exit={:.6} pnl={:+.2}% (${:+.2}) in {}s",
            self.position.symbol,
            self.exit_reason,
            self.position.entry_price,
            self.exit_price,
            self.profit_percent,
            self.profit_usd,
            self.duration_seconds,
        )
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Derived per-day performance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_profit_usd: f64,
    pub total_profit_percent: f64,
    /// Percentage of closed trades with positive P&L.
    pub win_rate: f64,
    pub best_trade_percent: f64,
    pub worst_trade_percent: f64,
    pub avg_duration_seconds: i64,
}

impl DailyAggregate {
    /// A day with no closed trades.
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_profit_usd: 0.0,
            total_profit_percent: 0.0,
            win_rate: 0.0,
            best_trade_percent: 0.0,
            worst_trade_percent: 0.0,
            avg_duration_seconds: 0,
        }
    }
}

impl fmt::Display for DailyAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: trades={} (W{}/L{}) win_rate={:.1}% pnl={:+.2}% (${:+.2}) best={:+.2}% worst={:+.2}%",
            self.date,
            self.total_trades,
            self.winning_trades,
            self.losing_trades,
            self.win_rate,
            self.total_profit_percent,
            self.total_profit_usd,
            self.best_trade_percent,
            self.worst_trade_percent,
        )
    }
}

/// Totals across every closed trade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllTimeStats {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub total_profit_usd: f64,
    pub avg_profit_percent: f64,
    pub win_rate: f64,
    pub best_trade_percent: f64,
    pub worst_trade_percent: f64,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain errors for the trading core.
#[derive(Debug, thiserror::Error)]
pub enum TradeError {
    #[error("Data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("Order rejected for {symbol}: {reason}")]
    OrderRejected {
        symbol: String,
        reason: String,
        retryable: bool,
    },

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("A position in {symbol} is already open")]
    PositionAlreadyOpen { symbol: String },

    #[error("No open position")]
    NoPosition,

    #[error("Insufficient capital: have ${available:.2}, need ${minimum:.2}")]
    InsufficientCapital { available: f64, minimum: f64 },

    #[error("Invalid quantity for {symbol}: {reason}")]
    InvalidQuantity { symbol: String, reason: String },

    #[error("Failed to exit {symbol} on shutdown after {attempts} attempts: {reason}")]
    ShutdownExitFailed {
        symbol: String,
        attempts: u32,
        reason: String,
    },

    #[error("{count} closed trade(s) could not be written to the ledger")]
    UnrecordedCloses { count: usize },
}

impl TradeError {
    /// Whether repeating the failed operation might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DataUnavailable { .. } | Self::Persistence(_) => true,
            Self::OrderRejected { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for TradeError {
    fn from(e: sqlx::Error) -> Self {
        TradeError::Persistence(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
