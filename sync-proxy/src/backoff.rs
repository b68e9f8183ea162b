//! Exponential retry backoff with cancellable sleeps.
//!
//! Shared by the long-poll loop and transaction delivery: start at 2s, double
//! after each failed attempt, never exceed 120s.

use crate::config::RetryConfig;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// First retry delay.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Upper bound for the retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Retry delay bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First delay of a failure streak.
    pub initial: Duration,
    /// Cap on any single delay.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: INITIAL_RETRY_DELAY,
            max: MAX_RETRY_DELAY,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms.max(config.initial_ms)),
        }
    }
}

impl RetryPolicy {
    /// Start a new failure streak.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.initial,
        }
    }
}

/// Delay state for one failure streak.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    /// The delay to wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the current delay and double it for next time, capped.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.policy.max);
        delay
    }

    /// Back to the initial delay after an attempt that didn't need a retry.
    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }

    /// Sleep for the next delay unless `cancel` fires first.
    ///
    /// Returns `false` if the sleep was interrupted by cancellation.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
