//! # Retry
//!
//! Exponential backoff shared by reconcile jobs and hub resubscription.
use std::time;

/// How long to wait before the next attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Multiplies the interval for every past attempt.
    pub backoff_coefficient: u32,
    /// Wait before the first retry.
    pub initial_interval: time::Duration,
    /// Upper bound of the wait, if any.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Wait before retry number `attempt`, starting at 1.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let multiplier = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate = self.initial_interval.saturating_mul(multiplier);

        match self.maximum_interval {
            Some(maximum) => candidate.min(maximum),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
