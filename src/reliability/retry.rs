//! Retry/backoff policy (C1): pure computation of the next delay from a
//! policy and the attempt number that just failed.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the base interval grows with attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Controls retry behavior for activities.
///
/// `maximum_attempts = 0` means unlimited attempts — this mirrors the
/// original Python reference implementation rather than the teacher's own
/// `RetryPolicy`, whose `max_attempts: u32` has no such sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub initial_interval_secs: f64,
    pub backoff_coefficient: f64,
    pub maximum_interval_secs: Option<f64>,
    pub maximum_attempts: u32,
    pub jitter: f64,
    #[serde(default)]
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_interval_secs: 1.0,
            backoff_coefficient: 2.0,
            maximum_interval_secs: Some(60.0),
            maximum_attempts: 0,
            jitter: 0.0,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self::default()
    }

    pub fn linear() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            ..Self::default()
        }
    }

    pub fn with_initial_interval(mut self, secs: f64) -> Self {
        self.initial_interval_secs = secs;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_maximum_interval(mut self, secs: f64) -> Self {
        self.maximum_interval_secs = Some(secs);
        self
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_error_types.push(error_type.into());
        self
    }

    /// Whether `attempt` (1-based, the attempt that just failed) has used up
    /// the retry budget. `maximum_attempts == 0` means unlimited.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.maximum_attempts > 0 && attempt >= self.maximum_attempts
    }

    pub fn is_retryable_error(&self, error_type: &str) -> bool {
        !self
            .non_retryable_error_types
            .iter()
            .any(|t| t == error_type)
    }
}

/// Pure computation of the next retry delay, in seconds, given the policy
/// and the 1-based attempt number that just failed.
///
/// `exponential -> initial * coeff^(attempt-1)`; `linear -> initial * attempt`.
/// Then clamp to `maximum_interval_secs`, then apply jitter, then floor at 0.
pub fn next_delay(policy: &RetryPolicy, attempt: u32) -> f64 {
    let mut interval = match policy.strategy {
        BackoffStrategy::Linear => policy.initial_interval_secs * attempt as f64,
        BackoffStrategy::Exponential => {
            policy.initial_interval_secs
                * policy
                    .backoff_coefficient
                    .powi(attempt.saturating_sub(1) as i32)
        }
    };

    if let Some(max) = policy.maximum_interval_secs {
        interval = interval.min(max);
    }

    if policy.jitter > 0.0 {
        let delta = interval * policy.jitter;
        let offset = rand::thread_rng().gen_range(-delta..=delta);
        interval += offset;
    }

    interval.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.strategy, BackoffStrategy::Exponential);
        assert_eq!(policy.initial_interval_secs, 1.0);
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert_eq!(policy.maximum_interval_secs, Some(60.0));
        assert_eq!(policy.maximum_attempts, 0);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn exponential_growth_no_jitter() {
        let policy = RetryPolicy::default().with_maximum_interval(1000.0);
        assert_eq!(next_delay(&policy, 1), 1.0);
        assert_eq!(next_delay(&policy, 2), 2.0);
        assert_eq!(next_delay(&policy, 3), 4.0);
        assert_eq!(next_delay(&policy, 4), 8.0);
    }

    #[test]
    fn linear_growth_no_jitter() {
        let policy = RetryPolicy::linear().with_initial_interval(2.0);
        assert_eq!(next_delay(&policy, 1), 2.0);
        assert_eq!(next_delay(&policy, 2), 4.0);
        assert_eq!(next_delay(&policy, 3), 6.0);
    }

    #[test]
    fn clamps_to_maximum_interval() {
        let policy = RetryPolicy::default().with_maximum_interval(5.0);
        assert_eq!(next_delay(&policy, 10), 5.0);
    }

    #[test]
    fn zero_maximum_attempts_means_unlimited() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(1));
        assert!(!policy.is_exhausted(1_000_000));
    }

    #[test]
    fn nonzero_maximum_attempts_is_enforced() {
        let policy = RetryPolicy::default().with_maximum_attempts(3);
        assert!(!policy.is_exhausted(1));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn non_retryable_error_types_are_recognised() {
        let policy = RetryPolicy::default()
            .with_non_retryable_error("ValidationError")
            .with_non_retryable_error("NotFoundError");

        assert!(!policy.is_retryable_error("ValidationError"));
        assert!(!policy.is_retryable_error("NotFoundError"));
        assert!(policy.is_retryable_error("TimeoutError"));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default()
            .with_jitter(0.5)
            .with_maximum_interval(1000.0);
        for attempt in 1..5 {
            let base = policy.initial_interval_secs
                * policy.backoff_coefficient.powi((attempt - 1) as i32);
            let delay = next_delay(&policy, attempt);
            assert!(delay >= (base * 0.5).max(0.0) - 1e-9);
            assert!(delay <= base * 1.5 + 1e-9);
        }
    }

    #[test]
    fn serialization_round_trips() {
        let policy = RetryPolicy::default().with_maximum_attempts(7);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
