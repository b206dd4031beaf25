//! The trading loop.
//!
//! One step either monitors the open position or, when flat, flushes queued
//! ledger writes, consults the governor and runs a scan that may open a new
//! position. `run` repeats steps until the shutdown signal fires, then
//! attempts a final exit of anything still open.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{AgentConfig, AppConfig};
use crate::engine::accountant::Accountant;
use crate::engine::backoff::RetryPolicy;
use crate::engine::position::{PositionManager, TickOutcome};
use crate::engine::scanner::MarketScanner;
use crate::platforms::Exchange;
use crate::storage::Ledger;
use crate::strategy::governor::{BlockReason, GovernorDecision, LossStreak, RiskGovernor};
use crate::strategy::scoring::Scorer;
use crate::types::{ExitReason, Position, TradeError, TradeRecord};

/// What a single step did.
#[derive(Debug)]
pub enum StepOutcome {
    /// Position still open after a monitoring tick.
    Holding,
    /// Monitoring tick could not price the position.
    PriceUnavailable,
    /// Exit order failed; retried next step.
    ExitFailed(TradeError),
    Exited(TradeRecord),
    Entered(Position),
    EntryFailed(TradeError),
    NoOpportunity,
    Blocked(BlockReason),
    /// Cycle-level failure (e.g. the ledger could not be read).
    Error(TradeError),
}

pub struct Orchestrator {
    scanner: MarketScanner,
    positions: PositionManager,
    governor: RiskGovernor,
    accountant: Accountant,
    streak: LossStreak,
    agent: AgentConfig,
    transient: RetryPolicy,
    order_policy: RetryPolicy,
    scans: u64,
    consecutive_errors: u32,
}

impl Orchestrator {
    pub fn new(config: &AppConfig, exchange: Arc<dyn Exchange>, ledger: Arc<Ledger>) -> Self {
        let scorer = Scorer::new(config.weights, config.indicators.clone());
        Self {
            scanner: MarketScanner::new(exchange.clone(), scorer, config.scanner.clone()),
            positions: PositionManager::new(
                exchange,
                config.trading.clone(),
                config.exchange.quote_asset.clone(),
            ),
            governor: RiskGovernor::new(config.risk.clone()),
            accountant: Accountant::new(ledger, config.backoff.persistence.to_policy()),
            streak: LossStreak::default(),
            agent: config.agent.clone(),
            transient: config.backoff.transient.to_policy(),
            order_policy: config.backoff.order.to_policy(),
            scans: 0,
            consecutive_errors: 0,
        }
    }

    /// Pick up where a previous run left off: queued closes, the open trade
    /// and the loss streak. Queued closes are replayed first, and an open
    /// row whose close is still queued is not restored since it was sold.
    pub async fn restore(&mut self) -> Result<(), TradeError> {
        let unwritten = self.accountant.replay_queue().await?;
        if let Some(position) = self.accountant.ledger().load_open_trade().await? {
            if self.accountant.has_queued_close(&position) {
                warn!(
                    symbol = %position.symbol,
                    trade_id = ?position.trade_id,
                    "Open row already sold, waiting for its queued close"
                );
            } else {
                self.positions.restore(position)?;
            }
        }
        self.streak = LossStreak::new(self.accountant.load_loss_streak().await);
        info!(
            open_position = self.positions.position().map(|p| p.symbol.as_str()).unwrap_or("none"),
            consecutive_losses = self.streak.count(),
            queued_closes = unwritten,
            "State restored"
        );
        Ok(())
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn accountant(&self) -> &Accountant {
        &self.accountant
    }

    pub fn loss_streak(&self) -> u32 {
        self.streak.count()
    }

    pub fn scans(&self) -> u64 {
        self.scans
    }

    // -----------------------------------------------------------------------
    // Step
    // -----------------------------------------------------------------------

    pub async fn step(&mut self) -> StepOutcome {
        if !self.positions.is_flat() {
            return self.monitor_step().await;
        }

        self.accountant.flush().await;

        let today = match self.accountant.today().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Could not load today's performance");
                return StepOutcome::Error(e);
            }
        };

        if let GovernorDecision::Block(reason) = self.governor.evaluate(&today, self.streak.count()) {
            info!(
                reason = %reason,
                pause_secs = self.governor.pause_for(&reason).as_secs(),
                "Trading paused by risk governor"
            );
            return StepOutcome::Blocked(reason);
        }

        self.scans += 1;
        let outcome = match self.scanner.best_opportunity().await {
            None => StepOutcome::NoOpportunity,
            Some(opp) => match self.positions.enter(&opp).await {
                Ok(position) => {
                    if let Some(id) = self.accountant.record_open(&position).await {
                        self.positions.attach_trade_id(id);
                    }
                    StepOutcome::Entered(self.positions.snapshot().unwrap_or(position))
                }
                Err(e) => {
                    warn!(symbol = %opp.symbol(), error = %e, "Entry failed");
                    StepOutcome::EntryFailed(e)
                }
            },
        };

        if self.agent.status_every_scans > 0 && self.scans % self.agent.status_every_scans == 0 {
            self.log_status().await;
        }
        outcome
    }

    async fn monitor_step(&mut self) -> StepOutcome {
        match self.positions.monitor().await {
            TickOutcome::Holding { levels_changed, .. } => {
                if levels_changed {
                    if let Some(position) = self.positions.position() {
                        self.accountant.update_levels(position).await;
                    }
                }
                StepOutcome::Holding
            }
            TickOutcome::PriceUnavailable => StepOutcome::PriceUnavailable,
            TickOutcome::Closed(record) => {
                self.on_close(record.clone()).await;
                StepOutcome::Exited(record)
            }
            TickOutcome::ExitFailed { error, .. } => StepOutcome::ExitFailed(error),
            TickOutcome::Flat => StepOutcome::Holding,
        }
    }

    async fn on_close(&mut self, record: TradeRecord) {
        let losses = self.streak.record(record.profit_percent);
        self.accountant.save_loss_streak(losses).await;
        self.accountant.record_close(record).await;
    }

    /// Clear the loss streak once a cooldown has been served.
    pub async fn finish_cooldown(&mut self) {
        info!(losses = self.streak.count(), "Cooldown complete, resetting loss streak");
        self.streak.reset();
        self.accountant.save_loss_streak(0).await;
    }

    /// How long to wait after `outcome` before the next step.
    pub fn delay_after(&mut self, outcome: &StepOutcome) -> Duration {
        let monitor = Duration::from_millis(self.agent.monitor_interval_ms);
        let scan = Duration::from_secs(self.agent.scan_interval_secs);
        let delay = match outcome {
            StepOutcome::Error(_) => {
                let delay = self.transient.delay_for(self.consecutive_errors);
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                return delay;
            }
            StepOutcome::Holding
            | StepOutcome::PriceUnavailable
            | StepOutcome::ExitFailed(_)
            | StepOutcome::Entered(_)
            | StepOutcome::Exited(_) => monitor,
            StepOutcome::Blocked(reason) => self.governor.pause_for(reason),
            StepOutcome::NoOpportunity | StepOutcome::EntryFailed(_) => scan,
        };
        self.consecutive_errors = 0;
        delay
    }

    async fn log_status(&self) {
        match self.accountant.status().await {
            Ok(report) => info!(
                scans = self.scans,
                pending_closes = report.pending_closes,
                "Status: {report}"
            ),
            Err(e) => warn!(error = %e, "Could not build status report"),
        }
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Run until `shutdown` flips to `true` (or its sender is dropped), then
    /// exit any open position.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TradeError> {
        info!(name = %self.agent.name, dry_run = self.agent.dry_run, "Trading loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let outcome = self.step().await;
            if let StepOutcome::Error(e) = &outcome {
                warn!(error = %e, "Cycle failed");
            }
            let delay = self.delay_after(&outcome);

            let stop = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };
            if stop {
                break;
            }
            if let StepOutcome::Blocked(BlockReason::Cooldown { .. }) = outcome {
                self.finish_cooldown().await;
            }
        }
        info!("Shutdown requested");
        self.shutdown().await
    }

    /// Close any open position with reason SHUTDOWN, retrying under the
    /// order policy, then flush queued closes. Fails if the position stays
    /// open or a close is still unwritten.
    pub async fn shutdown(&mut self) -> Result<(), TradeError> {
        if let Some(symbol) = self.positions.position().map(|p| p.symbol.clone()) {
            self.exit_on_shutdown(symbol).await?;
        }
        self.accountant.flush().await;
        self.log_status().await;

        let count = self.accountant.pending_closes();
        if count > 0 {
            error!(count, "Closed trades still missing from the ledger at shutdown");
            return Err(TradeError::UnrecordedCloses { count });
        }
        Ok(())
    }

    async fn exit_on_shutdown(&mut self, symbol: String) -> Result<(), TradeError> {
        let attempts = self.order_policy.max_attempts();
        let mut last_error = String::new();
        for attempt in 0..attempts {
            match self.positions.exit(ExitReason::Shutdown).await {
                Ok(record) => {
                    self.on_close(record).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(symbol = %symbol, attempt = attempt + 1, attempts, error = %e, "Shutdown exit failed");
                    last_error = e.to_string();
                    if !e.is_retryable() {
                        error!(symbol = %symbol, error = %last_error, "Shutdown exit failed permanently");
                        return Err(TradeError::ShutdownExitFailed {
                            symbol,
                            attempts: attempt + 1,
                            reason: last_error,
                        });
                    }
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.order_policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        error!(symbol = %symbol, attempts, error = %last_error, "Could not close position on shutdown");
        Err(TradeError::ShutdownExitFailed {
            symbol,
            attempts,
            reason: last_error,
        })
    }
}
