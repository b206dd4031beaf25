//! Bounded exponential backoff with jitter.
//!
//! One [`RetryPolicy`] is configured per error class (`transient`,
//! `persistence`, `order`). Delays follow `min(max, base * 2^attempt)` with
//! up to ±10% jitter, and retries stop after `max_attempts`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const JITTER_FACTOR: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, base: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max_delay,
            jitter,
        }
    }

    /// A policy that never sleeps. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, false)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        let range = capped.as_secs_f64() * JITTER_FACTOR;
        if range <= 0.0 {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(-range..=range);
        let secs = (capped.as_secs_f64() + jitter).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Run `op` until it succeeds, attempts are exhausted, or it fails with
    /// an error `retryable` rejects. Returns the last error.
    pub async fn retry_if<T, E, F, Fut, P>(
        &self,
        label: &str,
        mut op: F,
        retryable: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !retryable(&e) {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
