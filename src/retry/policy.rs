use std::time::Duration;

use rand::Rng;

use crate::error::{ErrorKind, TxnMiddlewareError};

/// Attempt budget and backoff schedule for a [`RetryController`](super::RetryController).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included
    pub max_attempts: u32,
    /// Stop retrying once this much time has passed since the first attempt began
    pub max_retry_time: Option<Duration>,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied per failed attempt
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`
    pub jitter: f64,
    /// Also retry `ConnectionError` failures
    pub retry_connection_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_retry_time: Some(Duration::from_secs(30)),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            retry_connection_errors: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, without any delay or deadline.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            max_retry_time: None,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
            retry_connection_errors: false,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_max_retry_time(mut self, max_retry_time: Option<Duration>) -> Self {
        self.max_retry_time = max_retry_time;
        self
    }

    #[must_use]
    pub fn with_connection_retries(mut self, enabled: bool) -> Self {
        self.retry_connection_errors = enabled;
        self
    }

    /// Attempt budget, never below one.
    #[must_use]
    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether a failure of this kind is worth another attempt.
    #[must_use]
    pub fn is_retryable(&self, err: &TxnMiddlewareError) -> bool {
        match err.kind() {
            ErrorKind::TransientServer => true,
            ErrorKind::Connection => self.retry_connection_errors,
            _ => false,
        }
    }

    /// Delay to wait after `attempts` finished attempts.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        if self.initial_delay.is_zero() || self.max_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);

        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter > 0.0 {
            secs *= 1.0 + rng.random_range(-jitter..=jitter);
        }

        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs > cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        let mut rng = rand::rng();
        assert_eq!(policy.delay_for(1, &mut rng), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, &mut rng), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, &mut rng), Duration::from_secs(4));
        assert_eq!(policy.delay_for(30, &mut rng), policy.max_delay);
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        let mut rng = rand::rng();
        for _ in 0..100 {
            let d = policy.delay_for(1, &mut rng).as_secs_f64();
            assert!((0.79..=1.21).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn immediate_policy_never_waits() {
        let mut rng = rand::rng();
        assert_eq!(RetryPolicy::immediate(3).delay_for(2, &mut rng), Duration::ZERO);
    }

    #[test]
    fn connection_errors_are_opt_in() {
        let err = TxnMiddlewareError::ConnectionError("reset".into());
        assert!(!RetryPolicy::default().is_retryable(&err));
        assert!(RetryPolicy::default().with_connection_retries(true).is_retryable(&err));
    }
}
