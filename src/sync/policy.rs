//! Exponential backoff with a capped ceiling and additive jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry cadence for transient transfer failures.
///
/// The delay after the `n`th consecutive transient failure (counting from 0)
/// is `base_delay_ms * backoff_factor^n`, stretched by up to `jitter_factor`
/// of itself and clamped to `max_delay_ms`. Keeping `jitter_factor <=
/// backoff_factor - 1` makes consecutive delays non-decreasing whatever the
/// random draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 10 * 60 * 1_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms == 0 {
            return Err("retry.base_delay_ms must be positive".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("retry.max_delay_ms must be >= retry.base_delay_ms".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err("retry.backoff_factor must be a finite value >= 1".to_string());
        }
        if !(0.0..=self.backoff_factor - 1.0).contains(&self.jitter_factor) {
            return Err("retry.jitter_factor must lie in [0, backoff_factor - 1]".to_string());
        }
        Ok(())
    }

    /// Delay for failure number `attempt` with the jitter draw `unit` in `[0, 1]`.
    pub fn delay_ms_with(&self, attempt: u32, unit: f64) -> u64 {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(exp);
        let jittered = raw * (1.0 + self.jitter_factor * unit.clamp(0.0, 1.0));
        let cap = self.max_delay_ms as f64;
        if jittered.is_nan() || jittered >= cap {
            self.max_delay_ms
        } else {
            jittered as u64
        }
    }

    /// Delay for failure number `attempt` with a random jitter draw.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let unit = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_ms_with(attempt, unit)
    }

    /// Earliest retry time after a transient failure at `at_ms`.
    pub fn next_attempt_at(&self, at_ms: u64, attempt: u32) -> u64 {
        at_ms.saturating_add(self.delay_ms(attempt))
    }
}
