//! Reconnect delay: capped exponential backoff with uniform jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Backoff {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter: config.jitter,
        }
    }

    /// `min(base * 2^(attempt-1), max)` for attempt >= 1.
    pub fn nominal_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }

    /// Nominal delay moved by a uniform draw in `[-jitter, +jitter]` of itself.
    pub fn delay_with(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let nominal = self.nominal_delay_ms(attempt) as f64;
        let spread = nominal * self.jitter;
        let jittered = if spread > 0.0 {
            nominal + rng.random_range(-spread..=spread)
        } else {
            nominal
        };
        Duration::from_millis(jittered.max(0.0).round() as u64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
