//! Decision model: what happens to a job after an attempt ends.
//!
//! The Decider is a pure function of (attempts consumed, ceiling, outcome).
//! Applying the decision to a `Job` is done by the broker.

use std::time::Duration;

use super::errors::JobError;
use super::outcome::Outcome;
use super::retry::RetryPolicy;

/// The next action to take for a job whose attempt just ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Store the result; the job is `succeeded`.
    Complete { result: serde_json::Value },

    /// Requeue after a backoff delay.
    Retry { delay: Duration, error: JobError },

    /// Non-retryable failure; the job is `failed`.
    Fail { error: JobError },

    /// Retry ceiling reached; the job is `dead`.
    MarkDead { error: JobError },
}

impl Decision {
    /// Short label used in attempt history and logs.
    pub fn label(&self) -> String {
        match self {
            Decision::Complete { .. } => "complete".to_string(),
            Decision::Retry { delay, .. } => format!("retry in {}ms", delay.as_millis()),
            Decision::Fail { .. } => "fail".to_string(),
            Decision::MarkDead { .. } => "mark_dead".to_string(),
        }
    }
}

/// Decides the next action based on attempt accounting and outcome.
pub trait Decider: Send + Sync {
    /// # Arguments
    /// * `attempts` - attempts consumed, including the one that just ended
    /// * `max_attempts` - the job's retry ceiling
    /// * `outcome` - what the attempt produced
    fn decide(&self, attempts: u32, max_attempts: u32, outcome: Outcome) -> Decision;
}

/// Attempt-based retry with exponential backoff:
/// - retryable failure and attempts < max_attempts: retry after `next_delay`
/// - retryable failure otherwise: dead
/// - fatal failure: failed, regardless of remaining attempts
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, attempts: u32, max_attempts: u32, outcome: Outcome) -> Decision {
        match outcome {
            Outcome::Success(result) => Decision::Complete { result },
            Outcome::FatalFailure(error) => Decision::Fail { error },
            Outcome::RetryableFailure(error) if attempts < max_attempts => Decision::Retry {
                delay: self.retry_policy.next_delay(attempts),
                error,
            },
            Outcome::RetryableFailure(error) => Decision::MarkDead { error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decider() -> DefaultDecider {
        DefaultDecider::new(RetryPolicy::default())
    }

    #[test]
    fn success_completes() {
        let d = decider().decide(1, 3, Outcome::Success(json!("ok")));
        assert_eq!(d, Decision::Complete { result: json!("ok") });
    }

    #[test]
    fn retryable_failure_retries_with_backoff_while_attempts_remain() {
        let d = decider().decide(2, 3, Outcome::RetryableFailure(JobError::retryable("x")));
        assert!(matches!(d, Decision::Retry { delay, .. } if delay == Duration::from_secs(4)));
    }

    #[test]
    fn retryable_failure_at_ceiling_is_dead() {
        let d = decider().decide(3, 3, Outcome::RetryableFailure(JobError::retryable("x")));
        assert!(matches!(d, Decision::MarkDead { .. }));
    }

    #[test]
    fn fatal_failure_ignores_remaining_attempts() {
        let d = decider().decide(1, 10, Outcome::FatalFailure(JobError::fatal("no")));
        assert!(matches!(d, Decision::Fail { .. }));
        assert_eq!(d.label(), "fail");
    }
}
