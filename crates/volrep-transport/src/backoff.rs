//! Exponential backoff with jitter for retrying operations against shared endpoints.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for backoff behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds (default: 1000).
    pub initial_ms: u64,
    /// Maximum delay in milliseconds (default: 300000).
    pub max_ms: u64,
    /// Multiplier applied per retry (default: 2.0).
    pub multiplier: f64,
    /// Extra multiplier when the backend reported it is busy (default: 4.0).
    pub busy_multiplier: f64,
    /// Cap for busy delays, applied after the busy multiplier (default: 1200000).
    /// Never lower than `max_ms`.
    pub busy_max_ms: u64,
    /// Fraction of the delay randomly shaved off to spread retries (default: 0.25).
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 300_000,
            multiplier: 2.0,
            busy_multiplier: 4.0,
            busy_max_ms: 1_200_000,
            jitter_ratio: 0.25,
        }
    }
}

/// Hint attached to a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffHint {
    /// Regular exponential schedule.
    #[default]
    Default,
    /// The backend is busy; wait longer than the default schedule.
    Extended,
}

/// Computes retry delays.
#[derive(Debug, Clone, Default)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    /// Create a new policy with the given configuration.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// The policy configuration.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    ///
    /// Computes `initial * multiplier^(retry - 1)` capped at `max`. For
    /// [`BackoffHint::Extended`] that capped delay is then scaled by the busy multiplier
    /// and capped at `busy_max`, so a busy backend always waits longer than the regular
    /// schedule.
    pub fn base_delay(&self, retry: u32, hint: BackoffHint) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let raw_ms = self.config.initial_ms as f64 * self.config.multiplier.powi(exponent);
        let mut delay_ms = raw_ms.min(self.config.max_ms as f64).max(0.0);
        if hint == BackoffHint::Extended {
            delay_ms = (delay_ms * self.config.busy_multiplier.max(1.0)).min(self.busy_cap_ms());
        }
        Duration::from_millis(delay_ms as u64)
    }

    fn busy_cap_ms(&self) -> f64 {
        self.config.busy_max_ms.max(self.config.max_ms) as f64
    }

    /// Delay before retry number `retry` with jitter applied. Never exceeds the cap for
    /// `hint`.
    pub fn delay(&self, retry: u32, hint: BackoffHint) -> Duration {
        let base = self.base_delay(retry, hint);
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        let spread_ms = (base.as_millis() as f64 * ratio) as u64;
        if spread_ms == 0 {
            return base;
        }
        let shave = rand::thread_rng().gen_range(0..=spread_ms);
        base.saturating_sub(Duration::from_millis(shave))
    }
}
