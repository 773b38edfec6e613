use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-deliveries after the first execution
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    DeadLetter,
}

impl RetryPolicy {
    /// What to do after execution number `attempt` (0-based) failed.
    /// Delays double each time: base, 2·base, 4·base, ...
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::DeadLetter;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        RetryDecision::Retry {
            attempt: attempt + 1,
            delay: self.base_delay.saturating_mul(factor),
        }
    }
}
