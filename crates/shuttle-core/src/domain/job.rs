//! Job record and its state machine.
//!
//! Design:
//! - `Job` is the single source of truth for one unit of work.
//! - All state transitions happen through methods here, so every broker
//!   backend applies exactly the same rules.
//! - Backends only decide *which* job to touch and make the change durable.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::AttemptRecord;
use super::decision::{Decider, Decision};
use super::errors::{BrokerError, FailureKind, JobError};
use super::ids::{JobId, WorkerId};
use super::outcome::Outcome;
use super::spec::{JobDefaults, JobOrigin, JobSpec};
use super::time;

/// Job state.
///
/// State transitions:
/// - Queued -> Running -> Succeeded
/// - Queued -> Running -> Queued (retry with backoff, until max_attempts)
/// - Queued -> Running -> Dead (retry ceiling reached)
/// - Queued -> Running -> Failed (fatal failure)
/// - Scheduled -> Queued (scheduled_for elapsed)
/// - Queued | Scheduled -> Dead (cancelled)
/// - Dead | Failed -> Queued (operator retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Queued,
        JobState::Scheduled,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Dead,
    ];

    /// Is this a terminal state (no further transitions without an operator)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{s}'"))
    }
}

/// Time-bounded ownership of a running job by one worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub duration: Duration,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub state: JobState,

    /// Attempts consumed so far (an attempt is consumed when it ends).
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub exclusive: bool,

    pub enqueued_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Wall-clock limit for one attempt.
    pub timeout: Duration,

    pub result: Option<serde_json::Value>,

    /// Last failure (terminal for `failed`/`dead`).
    pub error: Option<JobError>,

    /// Present only while `running`.
    pub lease: Option<Lease>,

    pub origin: JobOrigin,

    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl Job {
    /// Build a new job from a validated spec.
    pub fn new(id: JobId, spec: JobSpec, defaults: &JobDefaults, now: DateTime<Utc>) -> Self {
        let scheduled_for = spec.scheduled_for;
        let state = match scheduled_for {
            Some(at) if at > now => JobState::Scheduled,
            _ => JobState::Queued,
        };
        Self {
            id,
            queue: spec.queue,
            kind: spec.kind,
            payload: spec.payload,
            state,
            attempt_count: 0,
            max_attempts: spec.max_attempts.unwrap_or(defaults.max_attempts),
            exclusive: spec.exclusive,
            enqueued_at: now,
            scheduled_for,
            started_at: None,
            finished_at: None,
            timeout: spec.timeout.unwrap_or(defaults.timeout),
            result: None,
            error: None,
            lease: None,
            origin: spec.origin,
            history: Vec::new(),
        }
    }

    /// The attempt number a worker sees while running (1-indexed).
    pub fn current_attempt(&self) -> u32 {
        self.attempt_count + 1
    }

    /// Queued and past `scheduled_for` (if any).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.scheduled_for.is_none_or(|at| at <= now)
    }

    /// Move a due `scheduled` job to `queued`. Returns true if it moved.
    pub fn promote_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == JobState::Scheduled && self.scheduled_for.is_none_or(|at| at <= now) {
            self.state = JobState::Queued;
            return true;
        }
        false
    }

    /// Queued -> Running, recording the lease.
    pub fn start_attempt(&mut self, worker_id: WorkerId, lease_duration: Duration, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.started_at = Some(now);
        self.lease = Some(Lease {
            worker_id,
            acquired_at: now,
            expires_at: time::add(now, lease_duration),
            duration: lease_duration,
        });
    }

    /// Fails with `LeaseExpired` unless `worker_id` currently owns the job.
    pub fn ensure_owned_by(&self, worker_id: &WorkerId) -> Result<&Lease, BrokerError> {
        match &self.lease {
            Some(lease) if self.state == JobState::Running && &lease.worker_id == worker_id => {
                Ok(lease)
            }
            _ => Err(BrokerError::LeaseExpired {
                job_id: self.id,
                worker_id: worker_id.clone(),
            }),
        }
    }

    /// Extend the lease by its own duration. Returns the new expiry.
    pub fn renew_lease(
        &mut self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, BrokerError> {
        let duration = self.ensure_owned_by(worker_id)?.duration;
        let expires_at = time::add(now, duration);
        if let Some(lease) = self.lease.as_mut() {
            lease.expires_at = expires_at;
        }
        Ok(expires_at)
    }

    /// Is this job running under a lease that has run out?
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Running && self.lease.as_ref().is_some_and(|l| l.is_expired(now))
    }

    /// End the current attempt: consume it, ask the decider, apply the decision.
    ///
    /// Must only be called on a running job.
    pub fn conclude_attempt(
        &mut self,
        outcome: Outcome,
        decider: &dyn Decider,
        now: DateTime<Utc>,
    ) -> Decision {
        debug_assert_eq!(self.state, JobState::Running);
        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
        let decision = decider.decide(self.attempt_count, self.max_attempts, outcome);

        let lease = self.lease.take();
        self.history.push(AttemptRecord {
            attempt: self.attempt_count,
            worker_id: lease.map(|l| l.worker_id),
            started_at: self.started_at,
            finished_at: now,
            error: match &decision {
                Decision::Complete { .. } => None,
                Decision::Retry { error, .. }
                | Decision::Fail { error }
                | Decision::MarkDead { error } => Some(error.clone()),
            },
            decision: decision.label(),
        });

        match &decision {
            Decision::Complete { result } => {
                self.state = JobState::Succeeded;
                self.result = Some(result.clone());
                self.error = None;
                self.finished_at = Some(now);
            }
            Decision::Retry { delay, error } => {
                self.state = JobState::Queued;
                self.scheduled_for = Some(time::add(now, *delay));
                self.error = Some(error.clone());
            }
            Decision::Fail { error } => {
                self.state = JobState::Failed;
                self.error = Some(error.clone());
                self.finished_at = Some(now);
            }
            Decision::MarkDead { error } => {
                self.state = JobState::Dead;
                self.error = Some(error.clone());
                self.finished_at = Some(now);
            }
        }
        decision
    }

    /// Queued | Scheduled -> Dead. Running jobs can only be stopped by
    /// timeout or lease expiry.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), BrokerError> {
        if !matches!(self.state, JobState::Queued | JobState::Scheduled) {
            return Err(BrokerError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                action: "cancel",
            });
        }
        self.state = JobState::Dead;
        self.error = Some(JobError {
            kind: FailureKind::Cancelled,
            message: "cancelled before execution".to_string(),
            retryable: false,
        });
        self.finished_at = Some(now);
        Ok(())
    }

    /// Dead | Failed -> Queued with a fresh attempt budget.
    pub fn revive(&mut self) -> Result<(), BrokerError> {
        if !matches!(self.state, JobState::Dead | JobState::Failed) {
            return Err(BrokerError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                action: "retry",
            });
        }
        self.state = JobState::Queued;
        self.attempt_count = 0;
        self.scheduled_for = None;
        self.finished_at = None;
        self.error = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decision::DefaultDecider;
    use crate::domain::retry::RetryPolicy;
    use chrono::{TimeDelta, TimeZone};
    use serde_json::json;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn job(max_attempts: u32) -> Job {
        let spec = JobSpec::new("q", "echo", json!({})).with_max_attempts(max_attempts);
        Job::new(JobId::from_ulid(Ulid::new()), spec, &JobDefaults::default(), t0())
    }

    fn worker() -> WorkerId {
        WorkerId::new("w-1")
    }

    #[test]
    fn future_scheduled_for_starts_scheduled() {
        let spec = JobSpec::new("q", "echo", json!({})).scheduled_for(t0() + TimeDelta::minutes(5));
        let mut j = Job::new(JobId::from_ulid(Ulid::new()), spec, &JobDefaults::default(), t0());
        assert_eq!(j.state, JobState::Scheduled);
        assert!(!j.promote_if_due(t0()));
        assert!(j.promote_if_due(t0() + TimeDelta::minutes(5)));
        assert!(j.is_eligible(t0() + TimeDelta::minutes(5)));
    }

    #[test]
    fn defaults_fill_open_fields() {
        let j = job(3);
        assert_eq!(j.max_attempts, 3);
        assert_eq!(j.timeout, JobDefaults::default().timeout);
        assert_eq!(j.attempt_count, 0);
    }

    #[test]
    fn retry_cycle_ends_dead_at_ceiling() {
        let decider = DefaultDecider::new(RetryPolicy::immediate());
        let mut j = job(3);
        for attempt in 1..=3 {
            j.start_attempt(worker(), Duration::from_secs(30), t0());
            assert_eq!(j.current_attempt(), attempt);
            j.conclude_attempt(
                Outcome::RetryableFailure(JobError::retryable("flaky")),
                &decider,
                t0(),
            );
        }
        assert_eq!(j.state, JobState::Dead);
        assert_eq!(j.attempt_count, 3);
        assert_eq!(j.history.len(), 3);
        assert_eq!(j.history[2].decision, "mark_dead");
        assert!(j.lease.is_none());
    }

    #[test]
    fn retry_sets_backoff() {
        let decider = DefaultDecider::new(RetryPolicy::default());
        let mut j = job(3);
        j.start_attempt(worker(), Duration::from_secs(30), t0());
        j.conclude_attempt(Outcome::RetryableFailure(JobError::retryable("x")), &decider, t0());
        assert_eq!(j.state, JobState::Queued);
        assert_eq!(j.scheduled_for, Some(t0() + TimeDelta::seconds(2)));
        assert!(!j.is_eligible(t0() + TimeDelta::seconds(1)));
        assert!(j.is_eligible(t0() + TimeDelta::seconds(2)));
    }

    #[test]
    fn renew_requires_ownership() {
        let mut j = job(3);
        j.start_attempt(worker(), Duration::from_secs(5), t0());

        let expiry = j.renew_lease(&worker(), t0() + TimeDelta::seconds(3)).unwrap();
        assert_eq!(expiry, t0() + TimeDelta::seconds(8));

        let err = j.renew_lease(&WorkerId::new("other"), t0()).unwrap_err();
        assert!(matches!(err, BrokerError::LeaseExpired { .. }));
    }

    #[test]
    fn cancel_only_before_lease() {
        let mut queued = job(3);
        queued.cancel(t0()).unwrap();
        assert_eq!(queued.state, JobState::Dead);

        let mut running = job(3);
        running.start_attempt(worker(), Duration::from_secs(5), t0());
        assert!(matches!(
            running.cancel(t0()),
            Err(BrokerError::InvalidTransition { action: "cancel", .. })
        ));
    }

    #[test]
    fn revive_resets_attempts() {
        let decider = DefaultDecider::default();
        let mut j = job(1);
        j.start_attempt(worker(), Duration::from_secs(5), t0());
        j.conclude_attempt(Outcome::FatalFailure(JobError::fatal("no")), &decider, t0());
        assert_eq!(j.state, JobState::Failed);

        j.revive().unwrap();
        assert_eq!(j.state, JobState::Queued);
        assert_eq!(j.attempt_count, 0);
        assert!(j.is_eligible(t0()));
    }

    #[test]
    fn state_string_roundtrip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("limbo".parse::<JobState>().is_err());
    }
}
