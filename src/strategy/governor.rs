//! Daily risk governor.
//!
//! Gates every new entry on three limits, checked in order: trades today,
//! realized P&L today, and the consecutive-loss streak. The check itself is
//! pure; the caller owns the sleep and the streak reset.

use std::fmt;
use std::time::Duration;

use crate::config::RiskConfig;
use crate::types::DailyAggregate;

/// System-state key the loss streak is mirrored under.
pub const LOSS_STREAK_KEY: &str = "consecutive_losses";

#[derive(Debug, Clone, PartialEq)]
pub enum BlockReason {
    MaxTrades { count: u32, limit: u32 },
    DailyLoss { pnl_percent: f64, limit_percent: f64 },
    Cooldown { losses: u32, duration: Duration },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::MaxTrades { count, limit } => {
                write!(f, "max trades per day reached ({count}/{limit})")
            }
            BlockReason::DailyLoss {
                pnl_percent,
                limit_percent,
            } => write!(
                f,
                "daily loss limit hit ({pnl_percent:+.2}% <= -{limit_percent:.2}%)"
            ),
            BlockReason::Cooldown { losses, duration } => write!(
                f,
                "{losses} consecutive losses, cooling down for {}s",
                duration.as_secs()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GovernorDecision {
    Allow,
    Block(BlockReason),
}

impl GovernorDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GovernorDecision::Allow)
    }
}

#[derive(Debug, Clone)]
pub struct RiskGovernor {
    config: RiskConfig,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, today: &DailyAggregate, consecutive_losses: u32) -> GovernorDecision {
        let c = &self.config;
        if today.total_trades >= c.max_trades_per_day {
            return GovernorDecision::Block(BlockReason::MaxTrades {
                count: today.total_trades,
                limit: c.max_trades_per_day,
            });
        }
        if today.total_profit_percent <= -c.max_daily_loss_pct {
            return GovernorDecision::Block(BlockReason::DailyLoss {
                pnl_percent: today.total_profit_percent,
                limit_percent: c.max_daily_loss_pct,
            });
        }
        if consecutive_losses >= c.max_consecutive_losses {
            return GovernorDecision::Block(BlockReason::Cooldown {
                losses: consecutive_losses,
                duration: Duration::from_secs(c.cooldown_secs),
            });
        }
        GovernorDecision::Allow
    }

    /// How long the loop should sleep for a given block.
    pub fn pause_for(&self, reason: &BlockReason) -> Duration {
        match reason {
            BlockReason::Cooldown { duration, .. } => *duration,
            _ => Duration::from_secs(self.config.limits_pause_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Loss streak
// ---------------------------------------------------------------------------

/// Consecutive losing trades. A break-even trade resets the streak.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossStreak {
    count: u32,
}

impl LossStreak {
    pub fn new(count: u32) -> Self {
        Self { count }
    }

    /// Record a closed trade and return the new streak length.
    pub fn record(&mut self, profit_percent: f64) -> u32 {
        if profit_percent < 0.0 {
            self.count = self.count.saturating_add(1);
        } else {
            self.count = 0;
        }
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn today(trades: u32, pnl: f64) -> DailyAggregate {
        DailyAggregate {
            total_trades: trades,
            total_profit_percent: pnl,
            ..DailyAggregate::empty(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
        }
    }

    fn governor() -> RiskGovernor {
        RiskGovernor::new(RiskConfig::default())
    }

    #[test]
    fn test_allows_fresh_day() {
        assert!(governor().evaluate(&today(0, 0.0), 0).is_allowed());
    }

    #[test]
    fn test_max_trades_block() {
        let d = governor().evaluate(&today(20, 5.0), 0);
        assert_eq!(
            d,
            GovernorDecision::Block(BlockReason::MaxTrades {
                count: 20,
                limit: 20
            })
        );
        assert!(governor().evaluate(&today(19, 5.0), 0).is_allowed());
    }

    #[test]
    fn test_daily_loss_block_is_inclusive() {
        let d = governor().evaluate(&today(3, -2.0), 0);
        assert!(matches!(
            d,
            GovernorDecision::Block(BlockReason::DailyLoss { .. })
        ));
        assert!(governor().evaluate(&today(3, -1.99), 0).is_allowed());
    }

    #[test]
    fn test_check_order_trades_before_loss() {
        let d = governor().evaluate(&today(25, -10.0), 5);
        assert!(matches!(
            d,
            GovernorDecision::Block(BlockReason::MaxTrades { .. })
        ));
    }

    #[test]
    fn test_three_losses_trigger_cooldown_then_reset() {
        let g = governor();
        let mut streak = LossStreak::default();
        streak.record(-0.3);
        streak.record(-0.1);
        assert!(g.evaluate(&today(2, -0.4), streak.count()).is_allowed());
        streak.record(-0.2);

        let GovernorDecision::Block(reason) = g.evaluate(&today(3, -0.6), streak.count()) else {
            panic!("expected cooldown block");
        };
        assert_eq!(
            reason,
            BlockReason::Cooldown {
                losses: 3,
                duration: Duration::from_secs(3600)
            }
        );
        assert_eq!(g.pause_for(&reason), Duration::from_secs(3600));

        streak.reset();
        assert!(g.evaluate(&today(3, -0.6), streak.count()).is_allowed());
    }

    #[test]
    fn test_streak_resets_on_non_negative() {
        let mut streak = LossStreak::new(2);
        assert_eq!(streak.record(0.0), 0);
        assert_eq!(streak.record(-1.0), 1);
        assert_eq!(streak.record(0.5), 0);
    }

    #[test]
    fn test_limits_pause_duration() {
        let cfg = RiskConfig {
            limits_pause_secs: 120,
            ..RiskConfig::default()
        };
        let g = RiskGovernor::new(cfg);
        let reason = BlockReason::MaxTrades { count: 1, limit: 1 };
        assert_eq!(g.pause_for(&reason), Duration::from_secs(120));
        assert!(reason.to_string().contains("1/1"));
    }
}
