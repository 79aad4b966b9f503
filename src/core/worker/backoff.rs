use std::time::Duration;

/// Bounded linear backoff for a worker's poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures after which the worker enters `Error`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// `min(error_count * base_delay, max_delay)`
    pub fn delay_for(&self, error_count: u32) -> Duration {
        self.base_delay
            .saturating_mul(error_count)
            .min(self.max_delay)
    }

    pub fn exhausted(&self, error_count: u32) -> bool {
        error_count >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }
}
