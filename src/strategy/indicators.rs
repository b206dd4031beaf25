//! Technical indicators over close (and high/low) series.
//!
//! Every function is pure and returns a neutral value when the input is
//! shorter than its lookback:
//!
//! | indicator | neutral |
//! |-----------|---------|
//! | RSI | 50 |
//! | MACD | all zero, no crossover |
//! | Bollinger | bands at ±2% of price, position 0.5 |
//! | Stochastic RSI | K = D = 50 |
//! | ATR | 0 |
//! | EMA | last close (0 when empty) |
//! | volatility | 0 |
//! | momentum | 0 per horizon |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    /// Histogram went from ≤ 0 to > 0 on the last bar.
    pub crossover: bool,
}

impl Macd {
    pub const NEUTRAL: Macd = Macd {
        macd: 0.0,
        signal: 0.0,
        histogram: 0.0,
        crossover: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// 0 at the lower band, 1 at the upper band. May fall outside [0, 1].
    pub position: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StochRsi {
    pub k: f64,
    pub d: f64,
}

impl StochRsi {
    pub const NEUTRAL: StochRsi = StochRsi { k: 50.0, d: 50.0 };
}

/// Percentage change per momentum horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Momentum {
    pub horizons: Vec<(usize, f64)>,
}

impl Momentum {
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.horizons.iter().map(|(_, v)| *v)
    }

    pub fn average(&self) -> f64 {
        if self.horizons.is_empty() {
            return 0.0;
        }
        self.values().sum::<f64>() / self.horizons.len() as f64
    }

    pub fn positive_count(&self) -> usize {
        self.values().filter(|v| *v > 0.0).count()
    }
}

pub const DEFAULT_MOMENTUM_HORIZONS: [usize; 3] = [15, 60, 240];

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population (ddof = 0) or sample (ddof = 1) standard deviation.
fn std_dev(xs: &[f64], ddof: usize) -> f64 {
    if xs.len() <= ddof {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - ddof) as f64;
    var.sqrt()
}

/// Full EMA series, seeded with the first value.
fn ema_series(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = match values.first() {
        Some(v) => *v,
        None => return out,
    };
    out.push(prev);
    for v in &values[1..] {
        prev += alpha * (v - prev);
        out.push(prev);
    }
    out
}

// ---------------------------------------------------------------------------
// Indicators
// ---------------------------------------------------------------------------

/// Simple-average RSI over the last `period` deltas.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }
    let tail = &closes[closes.len() - period - 1..];
    let (mut gain, mut loss) = (0.0, 0.0);
    for w in tail.windows(2) {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            gain += delta;
        } else {
            loss -= delta;
        }
    }
    let avg_gain = gain / period as f64;
    let avg_loss = loss / period as f64;
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}

/// Exponential moving average of the whole series. Returns the last close
/// when the series is shorter than `span`.
pub fn ema(closes: &[f64], span: usize) -> f64 {
    match closes.last() {
        None => 0.0,
        Some(last) if closes.len() < span => *last,
        Some(_) => ema_series(closes, span).last().copied().unwrap_or(0.0),
    }
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    if closes.len() < slow || closes.len() < 2 {
        return Macd::NEUTRAL;
    }
    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    let line: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let signal_line = ema_series(&line, signal);
    let hist: Vec<f64> = line.iter().zip(&signal_line).map(|(m, s)| m - s).collect();

    let n = hist.len();
    Macd {
        macd: line[n - 1],
        signal: signal_line[n - 1],
        histogram: hist[n - 1],
        crossover: hist[n - 2] <= 0.0 && hist[n - 1] > 0.0,
    }
}

pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Bollinger {
    let price = closes.last().copied().unwrap_or(0.0);
    if period == 0 || closes.len() < period {
        return Bollinger {
            upper: price * 1.02,
            middle: price,
            lower: price * 0.98,
            position: 0.5,
        };
    }
    let window = &closes[closes.len() - period..];
    let middle = mean(window);
    let sd = std_dev(window, 1);
    let upper = middle + k * sd;
    let lower = middle - k * sd;
    let width = upper - lower;
    let position = if width > 0.0 {
        (price - lower) / width
    } else {
        0.5
    };
    Bollinger {
        upper,
        middle,
        lower,
        position,
    }
}

/// Stochastic RSI with RSI evaluated at successive endpoints.
///
/// Needs `period + k_period + d_period - 2` RSI samples; each sample needs
/// `period + 1` closes. Any undefined component (flat RSI range, short
/// input) comes back as 50.
pub fn stoch_rsi(closes: &[f64], period: usize, k_period: usize, d_period: usize) -> StochRsi {
    if period == 0 || k_period == 0 || d_period == 0 || closes.len() < period + 1 {
        return StochRsi::NEUTRAL;
    }
    let wanted = period + k_period + d_period - 2;
    let available = closes.len() - period;
    let samples = wanted.min(available);
    let first_end = closes.len() - samples + 1;
    let rsis: Vec<f64> = (first_end..=closes.len())
        .map(|end| rsi(&closes[..end], period))
        .collect();

    if rsis.len() < period {
        return StochRsi::NEUTRAL;
    }
    let stoch: Vec<Option<f64>> = rsis
        .windows(period)
        .map(|w| {
            let lo = w.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = w.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let cur = w[w.len() - 1];
            if hi > lo {
                Some((cur - lo) / (hi - lo) * 100.0)
            } else {
                None
            }
        })
        .collect();

    let sma = |xs: &[Option<f64>], n: usize| -> Vec<Option<f64>> {
        if xs.len() < n {
            return Vec::new();
        }
        xs.windows(n)
            .map(|w| {
                let vals: Option<Vec<f64>> = w.iter().copied().collect();
                vals.map(|v| mean(&v))
            })
            .collect()
    };

    let k_series = sma(&stoch, k_period);
    let d_series = sma(&k_series, d_period);
    StochRsi {
        k: k_series.last().copied().flatten().unwrap_or(50.0),
        d: d_series.last().copied().flatten().unwrap_or(50.0),
    }
}

/// Mean true range over the last `period` bars. Mismatched slice lengths
/// yield 0.
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    if period == 0
        || highs.len() != closes.len()
        || lows.len() != closes.len()
        || closes.len() < period + 1
    {
        return 0.0;
    }
    let tr: Vec<f64> = (1..closes.len())
        .map(|i| {
            let prev = closes[i - 1];
            (highs[i] - lows[i])
                .max((highs[i] - prev).abs())
                .max((lows[i] - prev).abs())
        })
        .collect();
    mean(&tr[tr.len() - period..])
}

/// Population std of simple returns over the last `period` closes, in percent.
pub fn volatility(closes: &[f64], period: usize) -> f64 {
    if closes.len() < 2 {
        return 0.0;
    }
    let tail = &closes[closes.len().saturating_sub(period)..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    std_dev(&returns, 0) * 100.0
}

/// Percentage change over each horizon. The reference close sits `horizon`
/// bars from the end, counting the last bar.
pub fn momentum(closes: &[f64], horizons: &[usize]) -> Momentum {
    let last = closes.last().copied().unwrap_or(0.0);
    let horizons = horizons
        .iter()
        .map(|&h| {
            let change = if h > 0 && closes.len() > h {
                let old = closes[closes.len() - h];
                if old != 0.0 {
                    (last - old) / old * 100.0
                } else {
                    0.0
                }
            } else {
                0.0
            };
            (h, change)
        })
        .collect();
    Momentum { horizons }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
