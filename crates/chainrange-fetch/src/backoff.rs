//! Exponential backoff with full jitter.
//!
//! The delay before attempt `n` (1-based) is drawn uniformly from
//! `[0, min(starting_delay * multiplier^(n-2), max_delay)]`. The first
//! attempt runs immediately unless `delay_first_attempt` is set.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_max_attempts() -> u32 {
    10
}

fn default_starting_delay_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_full_jitter() -> bool {
    true
}

/// Configuration for [`Backoff`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Total attempts, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay before the first retry.
    #[serde(default = "default_starting_delay_ms")]
    pub starting_delay_ms: u64,
    /// Growth factor applied on each further retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Cap on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Draw each delay uniformly between zero and the computed delay.
    #[serde(default = "default_full_jitter")]
    pub full_jitter: bool,
    /// Wait `starting_delay_ms` before the very first attempt too.
    #[serde(default)]
    pub delay_first_attempt: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            starting_delay_ms: default_starting_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            full_jitter: default_full_jitter(),
            delay_first_attempt: false,
        }
    }
}

/// Stateless backoff policy: computes the delay before a given attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Upper bound of the delay before `attempt` (1-based), before jitter.
    /// `None` means "do not wait".
    pub fn ceiling(&self, attempt: u32) -> Option<Duration> {
        let retries_before = match (attempt, self.config.delay_first_attempt) {
            (0, _) | (1, false) => return None,
            (n, false) => n - 2,
            (n, true) => n - 1,
        };
        let exponent = i32::try_from(retries_before).unwrap_or(i32::MAX);
        let base_ms = self.config.starting_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.config.max_delay_ms as f64);
        Some(Duration::from_millis(capped_ms as u64))
    }

    /// The delay to sleep before `attempt`, jitter applied.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Option<Duration> {
        let ceiling = self.ceiling(attempt)?;
        if !self.config.full_jitter || ceiling.is_zero() {
            return Some(ceiling);
        }
        let ms = rng.gen_range(0..=ceiling.as_millis() as u64);
        Some(Duration::from_millis(ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
