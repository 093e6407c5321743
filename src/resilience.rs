//! Retry and backoff policy.
//!
//! [`RetryConfig`] captures an exponential backoff schedule. The downstream
//! sync uses it between Kafka write attempts; the backoff sleep itself lives
//! at the call site so it can be raced against the shutdown signal.

use std::time::Duration;

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::downstream(3)
    }
}

impl RetryConfig {
    /// Backoff schedule for downstream writes: 1 s doubling up to a 30 s cap.
    ///
    /// ```text
    /// Attempt  Delay before it
    /// -------  ---------------
    /// 1        (none)
    /// 2        1s
    /// 3        2s
    /// 4        4s
    /// ...      capped at 30s
    /// ```
    pub fn downstream(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }

    /// Fast-fail schedule for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            backoff_factor: 2.0,
        }
    }

    /// Calculate the delay preceding a given retry (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}
