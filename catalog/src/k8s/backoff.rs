use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

/// Exponential backoff with a ceiling on consecutive attempts.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_retries: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: &Config) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            max_retries: config.max_retries,
            attempts: 0,
        }
    }

    /// Returns the delay before the next attempt, or `None` once the
    /// retry ceiling has been exceeded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempts);
        self.attempts += 1;
        Some(self.initial.saturating_mul(factor).min(self.max))
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
