//! Backoff policy for network-class transport failures.
//!
//! Auth failures are terminal (the data is malicious or corrupted);
//! everything network-shaped retries with jittered exponential delay
//! up to the attempt cap, after which the message stays FAILED until a
//! retry sweep or manual action.

use std::time::Duration;

use rand::Rng;

use crate::error::TransportError;

pub const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Whether `error` warrants attempt number `attempt` (1-based).
    pub fn should_retry(&self, error: &TransportError, attempt: u32) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Delay before the given (1-based) attempt: base × 2^(n-1),
    /// capped, with ±25% jitter to avoid thundering herds.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        raw.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::default();
        // Jitter is bounded, so ordering of the midpoints is stable.
        assert!(policy.delay_for(1) <= Duration::from_millis(1250));
        assert!(policy.delay_for(5) >= Duration::from_secs(12));
        assert!(policy.delay_for(30) <= Duration::from_secs(75));
    }

    #[test]
    fn auth_failures_never_retry() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(&TransportError::AuthFailed, 1));
        assert!(!policy.should_retry(&TransportError::NotFound, 1));
        assert!(policy.should_retry(&TransportError::Timeout, 1));
        assert!(policy.should_retry(&TransportError::Network("reset".into()), 9));
    }

    #[test]
    fn attempt_cap_enforced() {
        let policy = RetryPolicy::default();
        let err = TransportError::Network("reset".into());
        assert!(policy.should_retry(&err, MAX_ATTEMPTS - 1));
        assert!(!policy.should_retry(&err, MAX_ATTEMPTS));
    }
}
