//! Position risk manager.
//!
//! Owns the single open position and walks it through
//! `Flat -> Open -> Closing -> Flat`. Entry sizes the order from the quote
//! balance and derives an ATR stop and target; each monitoring tick
//! ratchets the trailing stop and checks the exit triggers.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TradingConfig;
use crate::platforms::Exchange;
use crate::strategy::indicators;
use crate::types::{ExitReason, LevelMode, Opportunity, Position, PriceSeries, TradeError, TradeRecord};

/// Tightest and loosest ATR stop, as fractions of entry.
const STOP_FLOOR: f64 = 0.98;
const STOP_CEILING: f64 = 0.997;

// ---------------------------------------------------------------------------
// Level maths
// ---------------------------------------------------------------------------

/// Stop-loss, take-profit and the mode they came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub mode: LevelMode,
}

/// ATR-scaled levels, falling back to fixed percentages when the window is
/// too short for an ATR.
pub fn compute_levels(entry: f64, window: &PriceSeries, cfg: &TradingConfig) -> Levels {
    let atr = indicators::atr(&window.highs(), &window.lows(), &window.closes(), cfg.atr_period);
    if atr > 0.0 {
        let stop = (entry - cfg.atr_stop_multiplier * atr)
            .clamp(entry * STOP_FLOOR, entry * STOP_CEILING);
        Levels {
            stop_loss: stop,
            take_profit: entry + cfg.atr_target_multiplier * atr,
            mode: LevelMode::Atr,
        }
    } else {
        Levels {
            stop_loss: entry * (1.0 - cfg.stop_loss_pct / 100.0),
            take_profit: entry * (1.0 + cfg.take_profit_pct / 100.0),
            mode: LevelMode::Fixed,
        }
    }
}

/// Round `quantity` down to a multiple of `step`.
pub fn floor_to_step(quantity: f64, step: Decimal) -> Option<Decimal> {
    let q = Decimal::from_f64(quantity)?;
    if step <= Decimal::ZERO {
        return Some(q.round_dp_with_strategy(8, RoundingStrategy::ToZero).normalize());
    }
    Some(((q / step).floor() * step).normalize())
}

/// What one price observation did to a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickEval {
    pub exit: Option<ExitReason>,
    /// Stop, high-water mark or trailing flag moved.
    pub levels_changed: bool,
}

/// Apply one price to `pos`: raise the high-water mark, arm and ratchet the
/// trailing stop, then check take-profit, stop and duration in that order.
pub fn evaluate_tick(
    pos: &mut Position,
    price: f64,
    now: DateTime<Utc>,
    cfg: &TradingConfig,
) -> TickEval {
    let mut changed = false;

    if price > pos.high_water_mark {
        pos.high_water_mark = price;
        changed = true;
    }
    if !pos.trailing_active && pos.profit_percent(price) > cfg.trailing_activation_pct {
        pos.trailing_active = true;
        changed = true;
    }
    if pos.trailing_active {
        let trail = pos.high_water_mark * (1.0 - cfg.trailing_distance_pct / 100.0);
        if trail > pos.stop_loss {
            pos.stop_loss = trail;
            changed = true;
        }
    }

    let held = pos.held_for(now).num_seconds().max(0) as u64;
    let exit = if price >= pos.take_profit {
        Some(ExitReason::TakeProfit)
    } else if price <= pos.stop_loss {
        Some(if pos.trailing_active {
            ExitReason::TrailingStop
        } else {
            ExitReason::StopLoss
        })
    } else if held >= cfg.max_trade_duration_secs {
        Some(ExitReason::MaxDuration)
    } else {
        None
    };

    TickEval {
        exit,
        levels_changed: changed,
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum PositionState {
    Flat,
    Open {
        position: Position,
        /// Set when an exit order failed; retried on the next tick.
        pending_exit: Option<ExitReason>,
    },
    Closing {
        position: Position,
        reason: ExitReason,
    },
}

/// Result of one monitoring tick.
#[derive(Debug)]
pub enum TickOutcome {
    Flat,
    Holding { price: f64, levels_changed: bool },
    PriceUnavailable,
    Closed(TradeRecord),
    ExitFailed { reason: ExitReason, error: TradeError },
}

pub struct PositionManager {
    exchange: Arc<dyn Exchange>,
    config: TradingConfig,
    quote_asset: String,
    state: PositionState,
}

impl PositionManager {
    pub fn new(exchange: Arc<dyn Exchange>, config: TradingConfig, quote_asset: impl Into<String>) -> Self {
        Self {
            exchange,
            config,
            quote_asset: quote_asset.into(),
            state: PositionState::Flat,
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self.state, PositionState::Flat)
    }

    pub fn position(&self) -> Option<&Position> {
        match &self.state {
            PositionState::Flat => None,
            PositionState::Open { position, .. } | PositionState::Closing { position, .. } => {
                Some(position)
            }
        }
    }

    pub fn snapshot(&self) -> Option<Position> {
        self.position().cloned()
    }

    pub fn pending_exit(&self) -> Option<ExitReason> {
        match &self.state {
            PositionState::Open { pending_exit, .. } => *pending_exit,
            PositionState::Closing { reason, .. } => Some(*reason),
            PositionState::Flat => None,
        }
    }

    /// Adopt a position recovered from the ledger.
    pub fn restore(&mut self, position: Position) -> Result<(), TradeError> {
        if let Some(open) = self.position() {
            return Err(TradeError::PositionAlreadyOpen {
                symbol: open.symbol.clone(),
            });
        }
        info!(position = %position, "Restored open position");
        self.state = PositionState::Open {
            position,
            pending_exit: None,
        };
        Ok(())
    }

    /// Record the ledger row id once the entry has been persisted.
    pub fn attach_trade_id(&mut self, trade_id: i64) {
        if let PositionState::Open { position, .. } | PositionState::Closing { position, .. } =
            &mut self.state
        {
            position.trade_id = Some(trade_id);
        }
    }

    /// Open a position in `opp`. Nothing changes on any error.
    pub async fn enter(&mut self, opp: &Opportunity) -> Result<Position, TradeError> {
        if let Some(open) = self.position() {
            return Err(TradeError::PositionAlreadyOpen {
                symbol: open.symbol.clone(),
            });
        }
        let symbol = opp.symbol().to_string();

        let balance = self
            .exchange
            .get_balance(&self.quote_asset)
            .await
            .map_err(|e| TradeError::DataUnavailable {
                symbol: self.quote_asset.clone(),
                reason: e.to_string(),
            })?;
        let capital = balance * self.config.capital_per_trade;
        if capital < self.config.min_trade_capital {
            return Err(TradeError::InsufficientCapital {
                available: capital,
                minimum: self.config.min_trade_capital,
            });
        }

        let price = opp.current_price();
        if price <= 0.0 {
            return Err(TradeError::InvalidQuantity {
                symbol,
                reason: format!("non-positive price {price}"),
            });
        }

        let step = self
            .exchange
            .get_quantity_step(&symbol)
            .await
            .map_err(|e| TradeError::DataUnavailable {
                symbol: symbol.clone(),
                reason: e.to_string(),
            })?;
        let quantity = floor_to_step(capital / price, step)
            .filter(|q| *q > Decimal::ZERO)
            .ok_or_else(|| TradeError::InvalidQuantity {
                symbol: symbol.clone(),
                reason: format!("${capital:.2} at {price} rounds to zero with step {step}"),
            })?;

        let fill = self
            .exchange
            .place_market_buy(&symbol, quantity)
            .await
            .map_err(|e| {
                warn!(symbol = %symbol, error = %e, "Buy order rejected");
                TradeError::OrderRejected {
                    symbol: symbol.clone(),
                    reason: e.to_string(),
                    retryable: e.is_retryable(),
                }
            })?;

        let entry = if fill.price > 0.0 { fill.price } else { price };
        let filled_qty = if fill.quantity > 0.0 {
            fill.quantity
        } else {
            quantity.to_f64().unwrap_or(0.0)
        };
        let levels = compute_levels(entry, &opp.window, &self.config);

        let position = Position {
            id: Uuid::new_v4(),
            trade_id: None,
            symbol,
            entry_price: entry,
            quantity: filled_qty,
            entry_time: Utc::now(),
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
            high_water_mark: entry,
            trailing_active: false,
            level_mode: levels.mode,
            entry_score: opp.score.composite,
            sub_scores: opp.score.sub_scores,
        };

        info!(
            symbol = %position.symbol,
            entry = position.entry_price,
            quantity = position.quantity,
            stop = format!("{:.6}", position.stop_loss),
            target = format!("{:.6}", position.take_profit),
            mode = %position.level_mode,
            score = format!("{:.2}", position.entry_score),
            "Position opened"
        );

        self.state = PositionState::Open {
            position: position.clone(),
            pending_exit: None,
        };
        Ok(position)
    }

    /// One monitoring tick. A previously failed exit is retried before the
    /// price is re-evaluated.
    pub async fn monitor(&mut self) -> TickOutcome {
        self.monitor_at(Utc::now()).await
    }

    pub async fn monitor_at(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if let Some(reason) = self.pending_exit() {
            return self.exit_outcome(reason).await;
        }

        let symbol = match &self.state {
            PositionState::Open { position, .. } => position.symbol.clone(),
            _ => return TickOutcome::Flat,
        };

        let price = match self.exchange.get_current_price(&symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Price unavailable, will retry");
                return TickOutcome::PriceUnavailable;
            }
        };

        let eval = match &mut self.state {
            PositionState::Open { position, .. } => {
                let before = position.stop_loss;
                let eval = evaluate_tick(position, price, now, &self.config);
                if position.stop_loss > before {
                    debug!(
                        symbol = %symbol,
                        stop = format!("{:.6}", position.stop_loss),
                        hwm = format!("{:.6}", position.high_water_mark),
                        "Trailing stop raised"
                    );
                }
                eval
            }
            _ => return TickOutcome::Flat,
        };

        match eval.exit {
            Some(reason) => self.exit_outcome(reason).await,
            None => TickOutcome::Holding {
                price,
                levels_changed: eval.levels_changed,
            },
        }
    }

    async fn exit_outcome(&mut self, reason: ExitReason) -> TickOutcome {
        match self.exit(reason).await {
            Ok(record) => TickOutcome::Closed(record),
            Err(error) => TickOutcome::ExitFailed { reason, error },
        }
    }

    /// Sell the full position. On failure the position stays open with
    /// `reason` pending.
    pub async fn exit(&mut self, reason: ExitReason) -> Result<TradeRecord, TradeError> {
        let position = match std::mem::replace(&mut self.state, PositionState::Flat) {
            PositionState::Flat => return Err(TradeError::NoPosition),
            PositionState::Open { position, .. } | PositionState::Closing { position, .. } => {
                position
            }
        };
        self.state = PositionState::Closing {
            position: position.clone(),
            reason,
        };

        let quantity = match Decimal::from_f64(position.quantity) {
            Some(q) if q > Decimal::ZERO => q.normalize(),
            _ => {
                let symbol = position.symbol.clone();
                self.state = PositionState::Open {
                    position,
                    pending_exit: Some(reason),
                };
                return Err(TradeError::InvalidQuantity {
                    symbol,
                    reason: "position quantity not representable".to_string(),
                });
            }
        };

        match self.exchange.place_market_sell(&position.symbol, quantity).await {
            Ok(fill) => {
                let record = TradeRecord::close(position, fill.price, Utc::now(), reason);
                info!(trade = %record, "Position closed");
                self.state = PositionState::Flat;
                Ok(record)
            }
            Err(e) => {
                warn!(
                    symbol = %position.symbol,
                    reason = %reason,
                    error = %e,
                    "Exit order failed, position stays open"
                );
                let symbol = position.symbol.clone();
                self.state = PositionState::Open {
                    position,
                    pending_exit: Some(reason),
                };
                Err(TradeError::OrderRejected {
                    symbol,
                    reason: e.to_string(),
                    retryable: e.is_retryable(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
