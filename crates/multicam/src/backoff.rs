use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Reconnect delay schedule: base * multiplier^attempt, plus random jitter,
/// capped at `max_ms`.
///
/// Successive delays never decrease until [`reset`](Backoff::reset), so
/// jitter spreads out streams that failed together without ever shortening
/// the wait for a camera that keeps failing.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let cap = Duration::from_millis(self.config.max_ms);
        let exponent = self.attempt.min(63) as i32;
        let raw_ms = self.config.base_ms as f64 * self.config.multiplier.powi(exponent);

        let jitter = if self.config.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.config.jitter)
        } else {
            0.0
        };
        let ms = (raw_ms * (1.0 + jitter)).min(self.config.max_ms as f64);

        let delay = Duration::from_millis(ms as u64).max(self.last).min(cap);
        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over from the base delay, after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
