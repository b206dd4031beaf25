//! APEX TRADER: autonomous spot trading agent.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the open trade and loss streak from the ledger, and runs the
//! scan → enter → monitor → exit loop until Ctrl+C.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use apex_trader::config::AppConfig;
use apex_trader::engine::orchestrator::Orchestrator;
use apex_trader::platforms::binance::BinanceClient;
use apex_trader::platforms::paper::PaperExchange;
use apex_trader::platforms::Exchange;
use apex_trader::storage::Ledger;

const BANNER: &str = r#"
    _    ____  _______  __
   / \  |  _ \| ____\ \/ /
  / _ \ | |_) |  _|  \  /
 / ___ \|  __/| |___ /  \
/_/   \_\_|   |_____/_/\_\

  Autonomous spot scanner, ATR risk-managed
  v0.1.0 | TRADER
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("APEX_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();
    cfg.validate()?;

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        dry_run = cfg.agent.dry_run,
        scan_interval_secs = cfg.agent.scan_interval_secs,
        min_score = cfg.scanner.min_score_to_trade,
        quote = %cfg.exchange.quote_asset,
        "APEX starting up"
    );

    // -- Components ------------------------------------------------------

    let ledger = Arc::new(
        Ledger::connect(&cfg.agent.database_url)
            .await
            .with_context(|| format!("Failed to open ledger at {}", cfg.agent.database_url))?,
    );

    let binance = BinanceClient::from_env(&cfg.exchange)?;
    let exchange: Arc<dyn Exchange> = if cfg.agent.dry_run {
        info!(balance = cfg.agent.paper_balance, "Dry run: paper fills, live market data");
        Arc::new(PaperExchange::new(
            Arc::new(binance),
            cfg.exchange.quote_asset.clone(),
            cfg.agent.paper_balance,
        ))
    } else {
        if !binance.has_credentials() {
            bail!(
                "Live trading requires {} and {} to be set",
                cfg.exchange.api_key_env,
                cfg.exchange.api_secret_env
            );
        }
        warn!("LIVE TRADING ENABLED: orders will be sent to the exchange");
        Arc::new(binance)
    };

    let mut orchestrator = Orchestrator::new(&cfg, exchange, ledger.clone());
    orchestrator.restore().await?;

    // -- Shutdown wiring -------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Shutdown signal received.");
        let _ = shutdown_tx.send(true);
    });

    info!(
        interval_secs = cfg.agent.scan_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    // -- Main loop -------------------------------------------------------

    let result = orchestrator.run(shutdown_rx).await;
    ledger.close().await;

    match result {
        Ok(()) => {
            info!("APEX shut down cleanly.");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "APEX shut down with unresolved trades");
            std::process::exit(1);
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("apex_trader=info"));

    let json_logging = std::env::var("APEX_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
