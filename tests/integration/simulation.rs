//! Trading loop simulations.
//!
//! Drives the orchestrator step by step against the mock exchange and an
//! in-memory ledger, checking positions, orders and ledger rows together.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use apex_trader::config::AppConfig;
use apex_trader::engine::orchestrator::{Orchestrator, StepOutcome};
use apex_trader::storage::Ledger;
use apex_trader::strategy::governor::BlockReason;
use apex_trader::types::{ExitReason, TradeError};

use crate::mock_exchange::{liquid_stats, unit_atr_window, MockExchange, Side};

const SYMBOL: &str = "SOLUSDT";

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.agent.monitor_interval_ms = 1;
    cfg.agent.scan_interval_secs = 0;
    cfg.scanner.batch_delay_ms = 0;
    cfg.scanner.min_score_to_trade = 0.0;
    for policy in [
        &mut cfg.backoff.transient,
        &mut cfg.backoff.persistence,
        &mut cfg.backoff.order,
    ] {
        policy.base_ms = 0;
        policy.max_ms = 0;
    }
    cfg
}

async fn setup(cfg: &AppConfig) -> (Arc<MockExchange>, Arc<Ledger>, Orchestrator) {
    let mock = Arc::new(
        MockExchange::new(1000.0)
            .with_instrument(unit_atr_window(SYMBOL, 100.0, 300), liquid_stats())
            .with_broken_symbol("BADUSDT"),
    );
    let ledger = Arc::new(Ledger::in_memory().await.unwrap());
    let orc = Orchestrator::new(cfg, mock.clone(), ledger.clone());
    (mock, ledger, orc)
}

async fn enter(orc: &mut Orchestrator) -> apex_trader::types::Position {
    match orc.step().await {
        StepOutcome::Entered(pos) => pos,
        other => panic!("expected entry, got {other:?}"),
    }
}

async fn exit(orc: &mut Orchestrator) -> apex_trader::types::TradeRecord {
    match orc.step().await {
        StepOutcome::Exited(rec) => rec,
        other => panic!("expected exit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_trailing_stop_lifecycle() {
    let (mock, ledger, mut orc) = setup(&test_config()).await;
    mock.script_prices(SYMBOL, &[100.5, 101.2, 102.0, 101.3]);

    let pos = enter(&mut orc).await;
    assert_eq!(pos.symbol, SYMBOL);
    assert_eq!(pos.entry_price, 100.0);
    assert!((pos.quantity - 9.5).abs() < 1e-9);
    assert!((pos.stop_loss - 98.0).abs() < 1e-9);
    assert!((pos.take_profit - 103.0).abs() < 1e-9);
    assert!(pos.trade_id.is_some());

    for _ in 0..3 {
        assert!(matches!(orc.step().await, StepOutcome::Holding));
    }

    // Trailing state reached the ledger before the exit.
    let stored = ledger.load_open_trade().await.unwrap().unwrap();
    assert!(stored.trailing_active);
    assert!((stored.high_water_mark - 102.0).abs() < 1e-9);
    assert!((stored.stop_loss - 101.49).abs() < 1e-9);

    let rec = exit(&mut orc).await;
    assert_eq!(rec.exit_reason, ExitReason::TrailingStop);
    assert_eq!(rec.exit_price, 101.3);
    assert!((rec.profit_percent - 1.3).abs() < 1e-9);
    assert!((rec.profit_usd - 12.35).abs() < 1e-9);
    assert!(orc.positions().is_flat());
    assert_eq!(orc.loss_streak(), 0);

    let rows = ledger.recent_trades(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(Some(rows[0].id), pos.trade_id);
    assert_eq!(rows[0].status, "CLOSED");
    assert_eq!(rows[0].exit_reason.as_deref(), Some("TRAILING_STOP"));

    let today = ledger.daily_aggregate(Utc::now().date_naive()).await.unwrap();
    assert_eq!(today.total_trades, 1);
    assert_eq!(today.winning_trades, 1);
    assert!((today.total_profit_usd - 12.35).abs() < 1e-9);

    let sides: Vec<Side> = mock.orders().iter().map(|o| o.side).collect();
    assert_eq!(sides, vec![Side::Buy, Side::Sell]);
    assert!((mock.balance() - 1012.35).abs() < 1e-9);
}

#[tokio::test]
async fn test_daily_loss_blocks_entries() {
    let (mock, _ledger, mut orc) = setup(&test_config()).await;
    mock.script_prices(SYMBOL, &[97.5]);

    enter(&mut orc).await;
    let rec = exit(&mut orc).await;
    assert_eq!(rec.exit_reason, ExitReason::StopLoss);
    assert!((rec.profit_percent + 2.5).abs() < 1e-9);
    assert_eq!(orc.loss_streak(), 1);

    match orc.step().await {
        StepOutcome::Blocked(BlockReason::DailyLoss { limit_percent, .. }) => {
            assert_eq!(limit_percent, 2.0)
        }
        other => panic!("expected daily loss block, got {other:?}"),
    }
    assert_eq!(mock.orders().len(), 2);
}

#[tokio::test]
async fn test_loss_streak_cooldown_and_restore() {
    let mut cfg = test_config();
    cfg.risk.max_daily_loss_pct = 50.0;
    let (mock, ledger, mut orc) = setup(&cfg).await;
    mock.script_prices(SYMBOL, &[97.9]);

    for expected in 1..=3 {
        enter(&mut orc).await;
        assert_eq!(exit(&mut orc).await.exit_reason, ExitReason::StopLoss);
        assert_eq!(orc.loss_streak(), expected);
    }

    let outcome = orc.step().await;
    assert!(matches!(
        outcome,
        StepOutcome::Blocked(BlockReason::Cooldown { losses: 3, .. })
    ));
    assert_eq!(orc.delay_after(&outcome), Duration::from_secs(3600));

    // The streak survives a restart.
    let mut restarted = Orchestrator::new(&cfg, mock.clone(), ledger.clone());
    restarted.restore().await.unwrap();
    assert_eq!(restarted.loss_streak(), 3);
    assert!(restarted.positions().is_flat());

    restarted.finish_cooldown().await;
    assert_eq!(restarted.loss_streak(), 0);
    enter(&mut restarted).await;
}

#[tokio::test]
async fn test_max_trades_per_day() {
    let mut cfg = test_config();
    cfg.risk.max_trades_per_day = 1;
    let (mock, _ledger, mut orc) = setup(&cfg).await;
    mock.script_prices(SYMBOL, &[103.5]);

    enter(&mut orc).await;
    assert_eq!(exit(&mut orc).await.exit_reason, ExitReason::TakeProfit);
    assert!(matches!(
        orc.step().await,
        StepOutcome::Blocked(BlockReason::MaxTrades { count: 1, limit: 1 })
    ));
}

#[tokio::test]
async fn test_open_position_restored_after_restart() {
    let cfg = test_config();
    let (mock, ledger, mut orc) = setup(&cfg).await;
    mock.script_prices(SYMBOL, &[100.4]);
    let pos = enter(&mut orc).await;
    drop(orc);

    let mut restarted = Orchestrator::new(&cfg, mock.clone(), ledger.clone());
    restarted.restore().await.unwrap();
    let restored = restarted.positions().position().cloned().unwrap();
    assert_eq!(restored.trade_id, pos.trade_id);
    assert_eq!(restored.symbol, SYMBOL);
    assert!((restored.stop_loss - pos.stop_loss).abs() < 1e-9);

    mock.script_prices(SYMBOL, &[103.2]);
    assert_eq!(exit(&mut restarted).await.exit_reason, ExitReason::TakeProfit);

    // The close updated the existing row rather than adding another.
    let rows = ledger.recent_trades(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].exit_reason.as_deref(), Some("TAKE_PROFIT"));
}

#[tokio::test]
async fn test_exchange_outage_is_not_fatal() {
    let (mock, _ledger, mut orc) = setup(&test_config()).await;
    mock.script_prices(SYMBOL, &[100.3]);

    mock.set_error("maintenance");
    assert!(matches!(orc.step().await, StepOutcome::NoOpportunity));
    mock.clear_error();

    enter(&mut orc).await;
    mock.set_error("maintenance");
    assert!(matches!(orc.step().await, StepOutcome::PriceUnavailable));
    assert!(orc.positions().position().is_some());
    mock.clear_error();
    assert!(matches!(orc.step().await, StepOutcome::Holding));
}

#[tokio::test]
async fn test_failed_exit_retried_next_tick() {
    let (mock, ledger, mut orc) = setup(&test_config()).await;
    mock.script_prices(SYMBOL, &[97.0]);
    enter(&mut orc).await;

    mock.fail_next_sells(1);
    assert!(matches!(orc.step().await, StepOutcome::ExitFailed(_)));
    assert_eq!(orc.positions().pending_exit(), Some(ExitReason::StopLoss));
    assert!(ledger.load_open_trade().await.unwrap().is_some());

    assert_eq!(exit(&mut orc).await.exit_reason, ExitReason::StopLoss);
    assert!(ledger.load_open_trade().await.unwrap().is_none());
}

#[tokio::test]
async fn test_shutdown_signal_exits_open_position() {
    let (mock, ledger, orc) = setup(&test_config()).await;
    mock.script_prices(SYMBOL, &[100.2]);

    let (tx, rx) = watch::channel(false);
    let mut orc = orc;
    let handle = tokio::spawn(async move {
        let res = orc.run(rx).await;
        (res, orc)
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while mock.orders().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no entry within 5s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tx.send(true).unwrap();

    let (res, orc) = handle.await.unwrap();
    assert!(res.is_ok());
    assert!(orc.positions().is_flat());

    let orders = mock.orders();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[1].side, Side::Sell);
    assert_eq!(orders[1].fill.price, 100.2);

    let rows = ledger.recent_trades(10).await.unwrap();
    assert_eq!(rows[0].exit_reason.as_deref(), Some("SHUTDOWN"));
}

#[tokio::test]
async fn test_shutdown_exit_failure_is_reported() {
    let (mock, ledger, mut orc) = setup(&test_config()).await;
    mock.script_prices(SYMBOL, &[100.2]);
    enter(&mut orc).await;

    mock.fail_next_sells(u32::MAX);
    match orc.shutdown().await {
        Err(TradeError::ShutdownExitFailed { symbol, attempts, .. }) => {
            assert_eq!(symbol, SYMBOL);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected shutdown failure, got {other:?}"),
    }
    assert!(orc.positions().position().is_some());
    assert!(ledger.load_open_trade().await.unwrap().is_some());
}

#[tokio::test]
async fn test_unwritten_close_survives_shutdown_and_restart() {
    let cfg = test_config();
    let (mock, ledger, mut orc) = setup(&cfg).await;
    mock.script_prices(SYMBOL, &[100.2]);
    let pos = enter(&mut orc).await;

    sqlx::query("DROP TABLE daily_performance")
        .execute(ledger.pool())
        .await
        .unwrap();

    match orc.shutdown().await {
        Err(TradeError::UnrecordedCloses { count }) => assert_eq!(count, 1),
        other => panic!("expected unrecorded close, got {other:?}"),
    }
    assert!(orc.positions().is_flat());
    assert_eq!(mock.orders().len(), 2);
    drop(orc);

    // The sold position is not brought back while its close is queued.
    let mut restarted = Orchestrator::new(&cfg, mock.clone(), ledger.clone());
    restarted.restore().await.unwrap();
    assert!(restarted.positions().is_flat());
    assert_eq!(restarted.accountant().pending_closes(), 1);
    assert!(matches!(
        restarted.shutdown().await,
        Err(TradeError::UnrecordedCloses { count: 1 })
    ));
    drop(restarted);

    // Once the ledger recovers the queued close lands on the original row.
    ledger.migrate().await.unwrap();
    let mut recovered = Orchestrator::new(&cfg, mock.clone(), ledger.clone());
    recovered.restore().await.unwrap();
    assert!(recovered.positions().is_flat());
    assert_eq!(recovered.accountant().pending_closes(), 0);
    assert!(ledger.load_open_trade().await.unwrap().is_none());

    let rows = ledger.recent_trades(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(Some(rows[0].id), pos.trade_id);
    assert_eq!(rows[0].exit_reason.as_deref(), Some("SHUTDOWN"));
    assert_eq!(mock.orders().len(), 2);
}
