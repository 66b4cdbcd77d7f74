use std::time::Duration;

/// Upper bound for a single backoff, in seconds.
pub const MAX_BACKOFF_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`; `retry_count` is the already incremented counter.
    Retry { retry_count: u32, delay: Duration },
    Fail,
}

/// Exponential backoff: `min(2^retry_count, max_delay)` seconds.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_delay: Duration::from_secs(MAX_BACKOFF_SECS) }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let secs = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_delay)
    }

    pub fn decide(&self, retry_count: u32, max_retries: u32) -> RetryDecision {
        if retry_count < max_retries {
            let retry_count = retry_count + 1;
            RetryDecision::Retry { retry_count, delay: self.backoff(retry_count) }
        } else {
            RetryDecision::Fail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(8), Duration::from_secs(256));
        assert_eq!(policy.backoff(9), Duration::from_secs(300), "2^9 exceeds the cap");
        assert_eq!(policy.backoff(200), Duration::from_secs(300), "huge exponents must not overflow");
    }

    #[test]
    fn three_retries_then_fail() {
        let policy = RetryPolicy::default();
        let mut retry_count = 0;
        let mut delays = vec![];

        while let RetryDecision::Retry { retry_count: next, delay } = policy.decide(retry_count, 3) {
            retry_count = next;
            delays.push(delay.as_secs());
        }

        assert_eq!(delays, vec![2, 4, 8]);
        assert_eq!(retry_count, 3);
        assert_eq!(policy.decide(retry_count, 3), RetryDecision::Fail);
    }

    #[test]
    fn zero_retries_fails_immediately() {
        assert_eq!(RetryPolicy::default().decide(0, 0), RetryDecision::Fail);
    }
}
