//! Retry and backoff policy for batch delivery

use crate::errors::ForwarderError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * attempt`
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

impl BackoffStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "linear" => Some(BackoffStrategy::Linear),
            "exponential" | "exp" => Some(BackoffStrategy::Exponential),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a batch sees at most `max_retries + 1` sends
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(50),
            strategy: BackoffStrategy::Linear,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1 is the first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);

        let delay = match self.strategy {
            BackoffStrategy::Linear => self.base_backoff.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_backoff.saturating_mul(factor)
            }
        };

        delay.min(self.max_backoff)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Attempt bookkeeping for the single batch in flight.
#[derive(Debug)]
pub struct RetryState {
    attempts: u32,
    last_error: Option<ForwarderError>,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            last_error: None,
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_failure(&mut self, error: ForwarderError) {
        self.last_error = Some(error);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Retries already consumed.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempts >= policy.max_attempts()
    }

    /// Delay before the next attempt.
    pub fn next_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.delay_for(self.attempts)
    }

    pub fn last_error(&self) -> Option<&ForwarderError> {
        self.last_error.as_ref()
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}
