//! Error taxonomy.
//!
//! Two families:
//! - `BrokerError`: returned by broker/store operations (admission, leasing,
//!   reporting, storage).
//! - `JobError`: produced while executing one attempt of a job. Its
//!   `retryable` flag decides between `RetryableFailure` and `FatalFailure`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{JobId, ScheduleId, WorkerId};
use super::job::JobState;

/// A malformed job or schedule, rejected synchronously at admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("queue is missing")]
    MissingQueue,

    #[error("queue name '{0}' is invalid (use 1-64 chars of [A-Za-z0-9_.-])")]
    InvalidQueue(String),

    #[error("job kind is missing")]
    MissingKind,

    #[error("payload is missing")]
    MissingPayload,

    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("queue '{0}' is not configured")]
    UnknownQueue(String),

    #[error("schedule name is missing")]
    MissingScheduleName,

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("lease on {job_id} is no longer held by {worker_id}")]
    LeaseExpired { job_id: JobId, worker_id: WorkerId },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(ScheduleId),

    #[error("cannot {action} job {job_id} in state {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        action: &'static str,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    pub fn storage(err: impl fmt::Display) -> Self {
        BrokerError::Storage(err.to_string())
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error.
    Handler,
    /// The attempt exceeded the job's timeout.
    Timeout,
    /// The handler panicked.
    Panicked,
    /// The payload could not be decoded into the handler's type.
    Decode,
    /// No handler is registered for the job kind on this worker.
    UnknownKind,
    /// The worker's lease expired before it reported (worker presumed crashed).
    LeaseExpired,
    /// The attempt was torn down before producing a result.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Handler => "handler",
            FailureKind::Timeout => "timeout",
            FailureKind::Panicked => "panicked",
            FailureKind::Decode => "decode",
            FailureKind::UnknownKind => "unknown_kind",
            FailureKind::LeaseExpired => "lease_expired",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure of one execution attempt.
///
/// Errors are retryable unless the job logic explicitly says otherwise with
/// [`JobError::fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    /// Transient failure; the broker retries until `max_attempts`.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Handler,
            message: message.into(),
            retryable: true,
        }
    }

    /// Non-retryable failure; the job goes straight to `failed`.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Handler,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("attempt timed out after {}ms", limit.as_millis()),
            retryable: true,
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panicked,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Decode,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn unknown_kind(kind: &str) -> Self {
        Self {
            kind: FailureKind::UnknownKind,
            message: format!("no handler registered for kind '{kind}'"),
            retryable: true,
        }
    }

    pub fn lease_expired() -> Self {
        Self {
            kind: FailureKind::LeaseExpired,
            message: "worker lease expired".to_string(),
            retryable: true,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: message.into(),
            retryable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_errors_are_retryable_unless_fatal() {
        assert!(JobError::retryable("flaky").retryable);
        assert!(!JobError::fatal("bad input").retryable);
        assert!(JobError::timeout(Duration::from_secs(1)).retryable);
        assert!(!JobError::decode("missing field").retryable);
    }

    #[test]
    fn job_error_display_includes_kind() {
        let err = JobError::timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timeout: attempt timed out after 1500ms");
    }

    #[test]
    fn validation_error_converts_into_broker_error() {
        let err: BrokerError = ValidationError::MissingQueue.into();
        assert!(matches!(err, BrokerError::Validation(ValidationError::MissingQueue)));
        assert_eq!(err.to_string(), "validation failed: queue is missing");
    }
}
