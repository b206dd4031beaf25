//! Market scanner.
//!
//! Fetches the volume-ranked universe, pulls a kline window and 24h stats
//! for each symbol in bounded concurrent batches, scores every instrument
//! and ranks them. Per-symbol failures are logged and skipped; a failed
//! universe fetch yields an empty scan.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::platforms::Exchange;
use crate::strategy::scoring::Scorer;
use crate::types::{Opportunity, PriceSeries, TradeError};

/// Minimum bars an instrument needs to be scored.
pub const MIN_BARS: usize = 60;

/// Bars kept in an opportunity's window.
pub const WINDOW_BARS: usize = 60;

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Short-lived cache of kline windows keyed by symbol, interval and limit.
struct PriceCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
}

struct CacheEntry {
    series: PriceSeries,
    inserted_at: Instant,
}

impl PriceCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn key(symbol: &str, interval: &str, limit: usize) -> String {
        format!("{symbol}|{interval}|{limit}")
    }

    fn get(&self, key: &str) -> Option<&PriceSeries> {
        self.entries.get(key).and_then(|entry| {
            if entry.inserted_at.elapsed() < self.ttl {
                Some(&entry.series)
            } else {
                None
            }
        })
    }

    fn insert(&mut self, key: String, series: PriceSeries) {
        self.entries.insert(
            key,
            CacheEntry {
                series,
                inserted_at: Instant::now(),
            },
        );
    }

    fn evict_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct MarketScanner {
    exchange: Arc<dyn Exchange>,
    scorer: Scorer,
    config: ScannerConfig,
    cache: Mutex<PriceCache>,
}

impl MarketScanner {
    pub fn new(exchange: Arc<dyn Exchange>, scorer: Scorer, config: ScannerConfig) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Self {
            exchange,
            scorer,
            config,
            cache: Mutex::new(PriceCache::new(ttl)),
        }
    }

    /// Score the whole universe, best first.
    pub async fn scan(&self) -> Vec<Opportunity> {
        {
            let mut cache = self.cache.lock().await;
            cache.evict_expired();
            debug!(cached = cache.len(), "Price cache after eviction");
        }

        let symbols = match self.exchange.list_ranked_symbols(self.config.top_n).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Universe fetch failed, skipping scan");
                return Vec::new();
            }
        };
        info!(symbols = symbols.len(), "Scanning universe");

        let batch_size = self.config.batch_size.max(1);
        let batch_delay = Duration::from_millis(self.config.batch_delay_ms);
        let mut results = Vec::with_capacity(symbols.len());
        let batches: Vec<&[String]> = symbols.chunks(batch_size).collect();
        let batch_count = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            let outcomes = join_all(batch.iter().map(|s| self.scan_symbol(s))).await;
            for (symbol, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(opp) => results.push(opp),
                    Err(e) => debug!(symbol = %symbol, error = %e, "Instrument skipped"),
                }
            }
            if i + 1 < batch_count && !batch_delay.is_zero() {
                tokio::time::sleep(batch_delay).await;
            }
        }

        results.sort_by(|a, b| {
            b.score
                .composite
                .partial_cmp(&a.score.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        info!(
            scanned = symbols.len(),
            scored = results.len(),
            top = results.first().map(|o| o.symbol()).unwrap_or("-"),
            top_score = results.first().map(|o| o.score.composite).unwrap_or(0.0),
            "Scan complete"
        );
        results
    }

    /// The top-ranked instrument, if it clears `min_score_to_trade`.
    pub async fn best_opportunity(&self) -> Option<Opportunity> {
        let best = self.scan().await.into_iter().next()?;
        if best.score.composite >= self.config.min_score_to_trade {
            info!(opportunity = %best.score, "Opportunity found");
            Some(best)
        } else {
            info!(
                symbol = %best.symbol(),
                score = format!("{:.2}", best.score.composite),
                threshold = self.config.min_score_to_trade,
                "Best score below threshold"
            );
            None
        }
    }

    async fn scan_symbol(&self, symbol: &str) -> Result<Opportunity, TradeError> {
        let series = self.price_window(symbol).await?;
        if series.len() < MIN_BARS {
            return Err(TradeError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: format!("only {} bars", series.len()),
            });
        }

        let stats = self.exchange.get_24h_stats(symbol).await.map_err(|e| {
            warn!(symbol, error = %e, "24h stats fetch failed");
            TradeError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            }
        })?;

        let score = self.scorer.score(&series, &stats);
        Ok(Opportunity {
            score,
            window: series.tail(WINDOW_BARS),
        })
    }

    async fn price_window(&self, symbol: &str) -> Result<PriceSeries, TradeError> {
        let interval = &self.config.kline_interval;
        let limit = self.config.kline_limit;
        let key = PriceCache::key(symbol, interval, limit);

        if let Some(series) = self.cache.lock().await.get(&key) {
            debug!(symbol, "Price cache hit");
            return Ok(series.clone());
        }

        let series = self
            .exchange
            .get_price_window(symbol, interval, limit)
            .await
            .map_err(|e| {
                warn!(symbol, error = %e, "Kline fetch failed");
                TradeError::DataUnavailable {
                    symbol: symbol.to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.cache.lock().await.insert(key, series.clone());
        Ok(series)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
