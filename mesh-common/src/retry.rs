//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure bounded retrying with exponential backoff.
use std::time;

#[derive(Clone, Debug, PartialEq)]
/// A retry policy to determine whether and when a failed operation is attempted again.
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Coefficient to multiply initial_interval with for every past retry.
    pub backoff_coefficient: f64,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: f64, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Whether another attempt is allowed after `retries` retries already happened.
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Determine the interval before retry number `retry`, counting from zero, so the first retry
    /// waits `initial_interval` and the n-th waits `initial_interval * backoff_coefficient^n`.
    /// If not `None`, `preferred_retry_interval` is respected as long as it falls within
    /// `candidate_interval <= preferred_retry_interval <= maximum_interval`.
    pub fn retry_interval(
        &self,
        retry: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let candidate_secs =
            self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let candidate_interval = time::Duration::try_from_secs_f64(candidate_secs)
            .unwrap_or_else(|_| self.maximum_interval.unwrap_or(time::Duration::MAX));

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => {
                let min_interval_allowed = std::cmp::min(candidate_interval, max_interval);

                if min_interval_allowed <= duration && duration <= max_interval {
                    duration
                } else {
                    min_interval_allowed
                }
            }
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_retries: u32,
    pub backoff_coefficient: f64,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_coefficient: 2.0,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: f64, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> RetryPolicyBuilder {
        self.max_retries = max_retries;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
