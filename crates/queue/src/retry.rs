//! Redelivery policy and dead letter entries.

#![allow(missing_docs)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use faultline_common::WorkerConfig;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Deliveries allowed before a failing work item is dead-lettered.
    pub max_attempts: u32,
    /// Delay before the second delivery.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff defaults with the worker's attempt budget.
    #[must_use]
    pub fn from_worker(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before redelivering after the given failed attempt (1-based).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }

    /// Whether a work item that just failed its `attempt`-th delivery
    /// (1-based) gets another one.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Dead letter queue entry for failed work items.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry<T> {
    /// The failed work item.
    pub item: T,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last error message.
    pub last_error: String,
    /// Timestamp of last failure.
    pub failed_at: DateTime<Utc>,
}

impl<T> DeadLetterEntry<T> {
    pub fn new(item: T, attempts: u32, error: String) -> Self {
        Self {
            item,
            attempts,
            last_error: error,
            failed_at: Utc::now(),
        }
    }
}
