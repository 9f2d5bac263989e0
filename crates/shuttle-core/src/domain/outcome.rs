//! Outcome model: what a worker reports after one attempt.

use serde::{Deserialize, Serialize};

use super::errors::JobError;

/// Result of one execution attempt, as reported to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    /// The job finished; the value becomes the job's `result`.
    Success(serde_json::Value),

    /// Transient failure; retried with backoff until `max_attempts`.
    RetryableFailure(JobError),

    /// Non-retryable failure; the job becomes `failed` immediately.
    FatalFailure(JobError),
}

impl Outcome {
    pub fn success(result: serde_json::Value) -> Self {
        Outcome::Success(result)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::RetryableFailure(err) | Outcome::FatalFailure(err) => Some(err),
        }
    }
}

/// Handler results map onto outcomes by the error's own classification.
impl From<Result<serde_json::Value, JobError>> for Outcome {
    fn from(result: Result<serde_json::Value, JobError>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(err) if err.retryable => Outcome::RetryableFailure(err),
            Err(err) => Outcome::FatalFailure(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handler_result_maps_to_outcome() {
        let ok: Outcome = Ok(json!({"n": 1})).into();
        assert_eq!(ok, Outcome::Success(json!({"n": 1})));

        let retry: Outcome = Err(JobError::retryable("flaky")).into();
        assert!(matches!(retry, Outcome::RetryableFailure(_)));

        let fatal: Outcome = Err(JobError::fatal("bad")).into();
        assert!(matches!(fatal, Outcome::FatalFailure(_)));
    }

    #[test]
    fn outcome_is_tagged() {
        let v = serde_json::to_value(Outcome::Success(json!(42))).unwrap();
        assert_eq!(v["status"], "success");
        assert_eq!(v["value"], 42);
    }
}
