//! Job admission input (`JobSpec`) and the defaults applied to it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;
use super::ids::ScheduleId;

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOrigin {
    /// Submitted through the gateway.
    #[default]
    Submitted,

    /// Emitted by a schedule firing.
    Schedule {
        schedule_id: ScheduleId,
        fire_at: DateTime<Utc>,
    },
}

/// Defaults for fields a `JobSpec` leaves open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefaults {
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout: Duration::from_secs(300),
        }
    }
}

/// A job as handed to `Broker::enqueue`.
///
/// `max_attempts` and `timeout` are optional here; the gateway fills them
/// from the queue configuration and the broker falls back to its
/// `JobDefaults`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Earliest time the job may be leased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// At most one exclusive job per queue runs at a time.
    #[serde(default)]
    pub exclusive: bool,

    #[serde(default)]
    pub origin: JobOrigin,
}

impl JobSpec {
    pub fn new(
        queue: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            queue: queue.into(),
            kind: kind.into(),
            payload,
            max_attempts: None,
            timeout: None,
            scheduled_for: None,
            exclusive: false,
            origin: JobOrigin::Submitted,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Admission checks shared by every broker backend.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_queue_name(&self.queue)?;
        if self.kind.trim().is_empty() {
            return Err(ValidationError::MissingKind);
        }
        if self.payload.is_null() {
            return Err(ValidationError::MissingPayload);
        }
        if self.max_attempts == Some(0) {
            return Err(ValidationError::ZeroMaxAttempts);
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ValidationError::ZeroTimeout);
        }
        Ok(())
    }
}

pub fn validate_queue_name(queue: &str) -> Result<(), ValidationError> {
    if queue.is_empty() {
        return Err(ValidationError::MissingQueue);
    }
    let valid = queue.len() <= 64
        && queue
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(ValidationError::InvalidQueue(queue.to_string()));
    }
    Ok(())
}
