//! Instrument scoring.
//!
//! Maps indicator outputs through fixed lookup tables into five bounded
//! sub-scores, then combines them with the configured weights.

use crate::config::{IndicatorConfig, WeightsConfig};
use crate::strategy::indicators::{self, DEFAULT_MOMENTUM_HORIZONS};
use crate::types::{InstrumentScore, PriceSeries, Stats24h, SubScores, Trend};

/// Pairs that get the large-cap risk bonus.
pub const MAJOR_SYMBOLS: [&str; 6] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT",
];

/// Bars of 1-bar returns used for the volatility sub-score.
const VOLATILITY_WINDOW: usize = 60;
const MIN_BARS_MOMENTUM: usize = 60;
const MIN_BARS_TECHNICAL: usize = 50;

const STOCH_PERIOD: usize = 14;
const STOCH_K: usize = 3;
const STOCH_D: usize = 3;

#[derive(Debug, Clone)]
pub struct Scorer {
    weights: WeightsConfig,
    indicators: IndicatorConfig,
}

impl Scorer {
    pub fn new(weights: WeightsConfig, indicators: IndicatorConfig) -> Self {
        Self {
            weights,
            indicators,
        }
    }

    /// Score one instrument from its kline window and 24h ticker.
    pub fn score(&self, series: &PriceSeries, stats: &Stats24h) -> InstrumentScore {
        let closes = series.closes();
        let sub_scores = SubScores {
            volatility: volatility_score(&closes),
            volume: volume_score(stats),
            momentum: momentum_score(&closes),
            technical: self.technical_score(&closes),
            risk: risk_score(&series.symbol, stats),
        };
        InstrumentScore {
            symbol: series.symbol.clone(),
            composite: self.composite(&sub_scores),
            sub_scores,
            price: series.last_close().unwrap_or(0.0),
            trend: trend(&closes),
        }
    }

    pub fn composite(&self, s: &SubScores) -> f64 {
        let w = &self.weights;
        let raw = s.volatility * w.volatility
            + s.volume * w.volume
            + s.momentum * w.momentum
            + s.technical * w.technical
            + s.risk * w.risk;
        raw.clamp(0.0, 10.0)
    }

    /// Weighted mix of RSI, Stochastic RSI, MACD, Bollinger and trend signals.
    pub fn technical_score(&self, closes: &[f64]) -> f64 {
        if closes.len() < MIN_BARS_TECHNICAL {
            return 5.0;
        }
        let cfg = &self.indicators;
        let price = closes[closes.len() - 1];

        let rsi = indicators::rsi(closes, cfg.rsi_period);
        let rsi_score = if rsi < cfg.rsi_oversold {
            9.0
        } else if rsi < cfg.rsi_oversold + 10.0 {
            7.0
        } else if rsi > cfg.rsi_overbought {
            2.0
        } else if rsi > cfg.rsi_overbought - 10.0 {
            4.0
        } else {
            5.0
        };

        let stoch = indicators::stoch_rsi(closes, STOCH_PERIOD, STOCH_K, STOCH_D);
        let stoch_score = if stoch.k < 20.0 && stoch.k > stoch.d {
            10.0
        } else if stoch.k < 20.0 {
            8.0
        } else if stoch.k > 80.0 {
            2.0
        } else {
            5.0
        };

        let macd = indicators::macd(closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal);
        let macd_score = if macd.crossover {
            10.0
        } else if macd.histogram > 0.0 {
            7.0
        } else if macd.histogram < 0.0 {
            3.0
        } else {
            5.0
        };

        let bb = indicators::bollinger(closes, cfg.bb_period, cfg.bb_std);
        let bb_score = if bb.position < 0.1 {
            10.0
        } else if bb.position < 0.3 {
            8.0
        } else if bb.position > 0.9 {
            2.0
        } else {
            5.0
        };

        let ema50 = indicators::ema(closes, 50);
        let trend_score = match trend(closes) {
            Trend::Bullish if price > ema50 => 8.0,
            Trend::Bearish => 3.0,
            _ => 5.0,
        };

        rsi_score * 0.20 + stoch_score * 0.20 + macd_score * 0.25 + bb_score * 0.15 + trend_score * 0.20
    }
}

// ---------------------------------------------------------------------------
// Lookup tables
// ---------------------------------------------------------------------------

pub fn volatility_score(closes: &[f64]) -> f64 {
    let v = indicators::volatility(closes, VOLATILITY_WINDOW);
    if v >= 3.0 {
        10.0
    } else if v >= 2.0 {
        8.0
    } else if v >= 1.0 {
        6.0
    } else if v >= 0.5 {
        4.0
    } else {
        2.0
    }
}

pub fn volume_score(stats: &Stats24h) -> f64 {
    let v = stats.quote_volume;
    if v >= 100_000_000.0 {
        10.0
    } else if v >= 50_000_000.0 {
        8.0
    } else if v >= 10_000_000.0 {
        6.0
    } else if v >= 1_000_000.0 {
        4.0
    } else {
        2.0
    }
}

pub fn momentum_score(closes: &[f64]) -> f64 {
    if closes.len() < MIN_BARS_MOMENTUM {
        return 5.0;
    }
    let m = indicators::momentum(closes, &DEFAULT_MOMENTUM_HORIZONS);
    let total = m.horizons.len();
    let positive = m.positive_count();
    let avg = m.average();
    if positive == total && avg > 1.0 {
        10.0
    } else if positive == total {
        8.0
    } else if positive as f64 >= total as f64 / 2.0 {
        6.0
    } else if avg < -1.0 {
        3.0
    } else {
        4.0
    }
}

pub fn risk_score(symbol: &str, stats: &Stats24h) -> f64 {
    let volume = stats.quote_volume;
    let mut score: f64 = 5.0;
    if volume >= 50_000_000.0 {
        score += 3.0;
    } else if volume >= 10_000_000.0 {
        score += 2.0;
    } else if volume >= 1_000_000.0 {
        score += 1.0;
    } else {
        score -= 2.0;
    }
    if MAJOR_SYMBOLS.contains(&symbol) {
        score += 2.0;
    }
    score.clamp(0.0, 10.0)
}

/// EMA50 vs EMA200.
pub fn trend(closes: &[f64]) -> Trend {
    let ema50 = indicators::ema(closes, 50);
    let ema200 = indicators::ema(closes, 200);
    if ema50 > ema200 {
        Trend::Bullish
    } else if ema50 < ema200 {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}
