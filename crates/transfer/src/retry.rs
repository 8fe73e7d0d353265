//! Exponential backoff with jitter between retry attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay schedule for retrying retryable transfer failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries (backoff cap), in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for each subsequent retry.
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 15_000,
            factor: 2.0,
        }
    }
}

impl Backoff {
    /// Calculates the delay for a given retry number (1-based),
    /// with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay_ms as f64 / 1000.0 * self.factor.powi(exp);
        let capped = secs.min(self.max_delay_ms as f64 / 1000.0);
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        let with_jitter = (capped + capped * 0.25 * offset).max(0.0);
        Duration::from_secs_f64(with_jitter)
    }

    /// A schedule with no waiting, for tests and local endpoints.
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            factor: 1.0,
        }
    }
}
