//! Retry policy and delay computation.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_exponential: bool,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 0,
            retry_delay_ms: 0,
            retry_exponential: false,
            retry_max_delay_ms: u64::MAX,
        }
    }
}

impl RetryPolicy {
    /// `delay = min(RetryDelayMs * (RetryExponential ? 2^(attempt-1) : 1),
    /// RetryMaxDelayMs)`, where `attempt` is the 1-based attempt that just
    /// failed (so the delay before attempt 2 uses `attempt=1`).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor: u64 = if self.retry_exponential {
            1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX)
        } else {
            1
        };
        self.retry_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms)
    }

    /// Whether another attempt should be made after `attempt` has failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries + 1
    }
}
