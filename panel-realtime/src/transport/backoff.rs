//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,
    /// Ceiling for any single delay, jitter included
    pub max: Duration,
    /// Growth factor applied per failed attempt
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]`; 0.2 spreads each delay over ±20%
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Retry schedule. There is no attempt cap: the transport retries until torn down.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(32) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let max_secs = self.config.max.as_secs_f64();
        let base = (self.config.initial.as_secs_f64() * self.config.multiplier.max(1.0).powi(exponent))
            .min(max_secs);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
            (base * factor).min(max_secs)
        } else {
            base
        };

        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Called once a session has stayed up for at least `max`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
