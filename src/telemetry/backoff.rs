use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Capped exponential reconnect delay with symmetric jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter_pct: f64,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, jitter_pct: f64) -> Self {
        let base_ms = base_ms.max(1);
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            jitter_pct: if jitter_pct.is_finite() {
                jitter_pct.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based): `base · 2^attempt`,
    /// capped at `max`, then moved by up to ±`jitter_pct`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2_u64.saturating_pow(attempt.min(32));
        let delay = self.base_ms.saturating_mul(exp).min(self.max_ms);
        if self.jitter_pct <= 0.0 {
            return Duration::from_millis(delay);
        }
        let spread = (delay as f64 * self.jitter_pct) as i64;
        let delta = rand::rng().random_range(-spread..=spread);
        Duration::from_millis(delay.saturating_add_signed(delta))
    }

    /// Upper bound of `delay(attempt)` including jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = 2_u64.saturating_pow(attempt.min(32));
        let delay = self.base_ms.saturating_mul(exp).min(self.max_ms);
        let spread = (delay as f64 * self.jitter_pct) as u64;
        Duration::from_millis(delay.saturating_add(spread))
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(config.base_ms, config.max_ms, config.jitter_pct)
    }
}
