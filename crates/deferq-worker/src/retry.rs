//! Retry policy for transient store failures.

use std::time::Duration;

use deferq_config::DeferqConfig;

/// Upper bound for a single backoff step.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per entry before it is handed back to the queue.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: MAX_DELAY,
        }
    }
}

impl RetryConfig {
    pub fn from_config(config: &DeferqConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: MAX_DELAY,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}
