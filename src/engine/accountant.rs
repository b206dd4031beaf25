//! Accountant: trade bookkeeping and performance reporting.
//!
//! Every ledger write goes through the `persistence` retry policy. A close
//! that still cannot be written is queued, mirrored into `system_state`, and
//! flushed on later cycles or replayed after a restart.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::engine::backoff::RetryPolicy;
use crate::storage::Ledger;
use crate::strategy::governor::LOSS_STREAK_KEY;
use crate::types::{AllTimeStats, DailyAggregate, Position, TradeError, TradeRecord};

/// `system_state` key holding closes not yet written to `trades`.
pub const PENDING_CLOSES_KEY: &str = "pending_closes";

// ---------------------------------------------------------------------------
// Status report
// ---------------------------------------------------------------------------

/// Today's and all-time performance, logged periodically.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub today: DailyAggregate,
    pub all_time: AllTimeStats,
    pub pending_closes: usize,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "today [{}] | all-time trades={} win_rate={:.1}% pnl=${:+.2} avg={:+.2}%",
            self.today,
            self.all_time.total_trades,
            self.all_time.win_rate,
            self.all_time.total_profit_usd,
            self.all_time.avg_profit_percent,
        )
    }
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant {
    ledger: Arc<Ledger>,
    policy: RetryPolicy,
    pending_closes: Vec<TradeRecord>,
}

impl Accountant {
    pub fn new(ledger: Arc<Ledger>, policy: RetryPolicy) -> Self {
        Self {
            ledger,
            policy,
            pending_closes: Vec::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pending_closes(&self) -> usize {
        self.pending_closes.len()
    }

    /// Persist a new entry. Returns `None` when the write is exhausted; the
    /// close will then insert the full row.
    pub async fn record_open(&self, position: &Position) -> Option<i64> {
        match self
            .policy
            .retry_if(
                "open_trade",
                || self.ledger.open_trade(position),
                TradeError::is_retryable,
            )
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                error!(symbol = %position.symbol, error = %e, "Failed to record open trade");
                None
            }
        }
    }

    /// Persist a closed trade, queueing it when retries are exhausted.
    /// Returns whether it was written now.
    pub async fn record_close(&mut self, record: TradeRecord) -> bool {
        match self.write_close(&record).await {
            Ok(id) => {
                info!(
                    trade_id = id,
                    symbol = %record.position.symbol,
                    reason = %record.exit_reason,
                    pnl = format!("{:+.2}%", record.profit_percent),
                    "Trade recorded"
                );
                true
            }
            Err(e) => {
                error!(
                    symbol = %record.position.symbol,
                    error = %e,
                    queued = self.pending_closes.len() + 1,
                    "Failed to record closed trade, queued for retry"
                );
                self.pending_closes.push(record);
                self.save_queue().await;
                false
            }
        }
    }

    async fn write_close(&self, record: &TradeRecord) -> Result<i64, TradeError> {
        self.policy
            .retry_if(
                "close_trade",
                || self.ledger.close_trade(record),
                TradeError::is_retryable,
            )
            .await
    }

    /// Mirror the close queue into `system_state`.
    async fn save_queue(&self) -> bool {
        match self
            .policy
            .retry_if(
                "set_state",
                || self.ledger.set_state(PENDING_CLOSES_KEY, &self.pending_closes),
                TradeError::is_retryable,
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    error = %e,
                    queued = self.pending_closes.len(),
                    "Failed to persist queued closes"
                );
                false
            }
        }
    }

    /// Load closes queued by a previous run and try to write them. Returns
    /// how many are still unwritten.
    pub async fn replay_queue(&mut self) -> Result<usize, TradeError> {
        let stored: Vec<TradeRecord> = self
            .ledger
            .get_state(PENDING_CLOSES_KEY)
            .await?
            .unwrap_or_default();
        if stored.is_empty() {
            return Ok(self.pending_closes.len());
        }
        info!(queued = stored.len(), "Replaying closes queued by a previous run");
        for record in stored {
            if !self.pending_closes.iter().any(|r| r.position.id == record.position.id) {
                self.pending_closes.push(record);
            }
        }
        self.flush().await;
        Ok(self.pending_closes.len())
    }

    /// Whether `position` was sold but its close is still queued.
    pub fn has_queued_close(&self, position: &Position) -> bool {
        self.pending_closes.iter().any(|r| {
            r.position.id == position.id
                || (position.trade_id.is_some() && r.position.trade_id == position.trade_id)
        })
    }

    /// Retry queued closes in order. Returns how many were written.
    pub async fn flush(&mut self) -> usize {
        if self.pending_closes.is_empty() {
            return 0;
        }
        let queued = std::mem::take(&mut self.pending_closes);
        let mut written = 0;
        for record in queued {
            match self.write_close(&record).await {
                Ok(_) => written += 1,
                Err(e) => {
                    warn!(symbol = %record.position.symbol, error = %e, "Queued close still failing");
                    self.pending_closes.push(record);
                }
            }
        }
        if written > 0 {
            info!(written, remaining = self.pending_closes.len(), "Flushed queued closes");
            self.save_queue().await;
        }
        written
    }

    /// Best-effort write of trailing-stop state.
    pub async fn update_levels(&self, position: &Position) {
        let Some(id) = position.trade_id else {
            return;
        };
        if let Err(e) = self
            .ledger
            .update_levels(id, position.stop_loss, position.high_water_mark, position.trailing_active)
            .await
        {
            warn!(trade_id = id, error = %e, "Failed to persist trailing levels");
        }
    }

    pub async fn save_loss_streak(&self, count: u32) {
        if let Err(e) = self
            .policy
            .retry_if(
                "set_state",
                || self.ledger.set_state(LOSS_STREAK_KEY, &count),
                TradeError::is_retryable,
            )
            .await
        {
            error!(error = %e, count, "Failed to persist loss streak");
        }
    }

    pub async fn load_loss_streak(&self) -> u32 {
        match self.ledger.get_state::<u32>(LOSS_STREAK_KEY).await {
            Ok(v) => v.unwrap_or(0),
            Err(e) => {
                warn!(error = %e, "Could not load loss streak, starting at 0");
                0
            }
        }
    }

    /// Today's aggregate (UTC), including queued closes that have not
    /// reached the ledger yet.
    pub async fn today(&self) -> Result<DailyAggregate, TradeError> {
        let date = Utc::now().date_naive();
        let mut agg = self
            .policy
            .retry_if(
                "daily_aggregate",
                || self.ledger.daily_aggregate(date),
                TradeError::is_retryable,
            )
            .await?;
        for rec in self
            .pending_closes
            .iter()
            .filter(|r| r.exit_time.date_naive() == date)
        {
            agg.total_trades += 1;
            agg.total_profit_percent += rec.profit_percent;
            agg.total_profit_usd += rec.profit_usd;
            if rec.is_win() {
                agg.winning_trades += 1;
            } else if rec.is_loss() {
                agg.losing_trades += 1;
            }
        }
        Ok(agg)
    }

    pub async fn status(&self) -> Result<StatusReport, TradeError> {
        Ok(StatusReport {
            today: self.today().await?,
            all_time: self.ledger.all_time_stats().await?,
            pending_closes: self.pending_closes.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
