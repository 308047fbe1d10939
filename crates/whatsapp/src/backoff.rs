//! Delay schedule for automatic reconnects after a non-logout close.

use std::time::Duration;

use {rand::Rng, wagate_config::ReconnectConfig};

/// Exponential backoff with a delay cap and an optional attempt ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` keeps retrying forever.
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    /// Retry instantly and forever.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: None,
            jitter: false,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
            jitter: config.jitter,
        }
    }

    /// Delay before reconnect `attempt` (1-based), or `None` once the
    /// ceiling is exceeded.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if let Some(max) = self.max_attempts
            && attempt > max
        {
            return None;
        }

        let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let secs = if self.jitter && capped > 0.0 {
            (capped * rand::rng().random_range(0.8..=1.2)).min(self.max_delay.as_secs_f64())
        } else {
            capped
        };
        Some(Duration::from_secs_f64(secs.max(0.0)))
    }
}
