//! Schedules: time-based triggers that emit jobs.
//!
//! # 発火のルール
//! - `next_fire_at` が「次に発火すべき時刻」であり、同時に二重発火防止のマーカー
//! - 発火後の次回時刻は常に `now` より厳密に後
//! - 停止中に溜まった発火は 1 回にまとめる（catch-up は 1 回だけ）

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::cron::CronExpr;
use super::errors::ValidationError;
use super::ids::{JobId, ScheduleId};
use super::spec::{JobOrigin, JobSpec, validate_queue_name};

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Every `every`, anchored at the first fire time.
    Interval { every: Duration },

    /// Five-field cron expression, UTC.
    Cron { expression: String },

    /// Fires once at `at`, then the schedule is exhausted.
    Once { at: DateTime<Utc> },
}

impl Trigger {
    pub fn every(every: Duration) -> Self {
        Trigger::Interval { every }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Trigger::Cron {
            expression: expression.into(),
        }
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Trigger::Once { at }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Trigger::Interval { every } if every.is_zero() => Err(ValidationError::InvalidTrigger(
                "interval must be greater than zero".to_string(),
            )),
            Trigger::Interval { every } if TimeDelta::from_std(*every).is_err() => Err(
                ValidationError::InvalidTrigger("interval is out of range".to_string()),
            ),
            Trigger::Cron { expression } => CronExpr::parse(expression)
                .map(|_| ())
                .map_err(|e| ValidationError::InvalidTrigger(e.to_string())),
            _ => Ok(()),
        }
    }

    /// First fire time for a schedule created at `now`.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { every } => Some(super::time::add(now, *every)),
            Trigger::Cron { expression } => CronExpr::parse(expression).ok()?.next_after(now),
            Trigger::Once { at } => Some(*at),
        }
    }

    /// Next fire time after firing at `fire_at`, strictly later than `now`.
    ///
    /// Missed firings between `fire_at` and `now` are skipped, so a schedule
    /// that was down for a while fires once on resume, not once per miss.
    /// Returns None when the trigger is exhausted.
    pub fn advance(&self, fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { every } => {
                let step = TimeDelta::from_std(*every).ok()?.num_milliseconds();
                if step <= 0 {
                    return None;
                }
                // Minimal k >= 1 with fire_at + k*every > now.
                let behind = (now - fire_at).num_milliseconds().max(0);
                let k = behind / step + 1;
                fire_at.checked_add_signed(TimeDelta::milliseconds(step.checked_mul(k)?))
            }
            Trigger::Cron { expression } => {
                CronExpr::parse(expression).ok()?.next_after(now.max(fire_at))
            }
            Trigger::Once { .. } => None,
        }
    }
}

/// The job a schedule emits on every firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub exclusive: bool,
}

impl JobTemplate {
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
            exclusive: false,
        }
    }

    pub fn to_spec(&self, origin: JobOrigin) -> JobSpec {
        JobSpec {
            queue: self.queue.clone(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            max_attempts: self.max_attempts,
            timeout: self.timeout,
            scheduled_for: None,
            exclusive: self.exclusive,
            origin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub trigger: Trigger,
    pub template: JobTemplate,

    /// None once a one-shot trigger has fired.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        id: ScheduleId,
        name: impl Into<String>,
        trigger: Trigger,
        template: JobTemplate,
        now: DateTime<Utc>,
    ) -> Self {
        let next_fire_at = trigger.first_fire(now);
        Self {
            id,
            name: name.into(),
            trigger,
            template,
            next_fire_at,
            last_fired_at: None,
            enabled: true,
            created_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingScheduleName);
        }
        self.trigger.validate()?;
        self.template.to_spec(JobOrigin::Submitted).validate()?;
        validate_queue_name(&self.template.queue)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at.is_some_and(|at| at <= now)
    }

    /// Apply a new definition of the same-named schedule.
    ///
    /// Firing state survives when the trigger is unchanged, so redeploying
    /// the same configuration neither re-fires nor skips a firing.
    pub fn merge_definition(&mut self, incoming: Schedule) {
        if self.trigger != incoming.trigger {
            self.trigger = incoming.trigger;
            self.next_fire_at = incoming.next_fire_at;
        }
        self.template = incoming.template;
        self.enabled = incoming.enabled;
    }

    /// Build the firing for `fire_at` evaluated at `now`.
    pub fn firing(&self, fire_at: DateTime<Utc>, now: DateTime<Utc>) -> ScheduleFiring {
        ScheduleFiring {
            schedule_id: self.id,
            fire_at,
            next_fire_at: self.trigger.advance(fire_at, now),
            job: self.template.to_spec(JobOrigin::Schedule {
                schedule_id: self.id,
                fire_at,
            }),
        }
    }
}

/// One firing, applied atomically by `ScheduleStore::fire_schedule`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleFiring {
    pub schedule_id: ScheduleId,

    /// Must still equal the stored `next_fire_at`, or the firing is stale.
    pub fire_at: DateTime<Utc>,

    pub next_fire_at: Option<DateTime<Utc>>,
    pub job: JobSpec,
}

/// Result of one applied firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub schedule_id: ScheduleId,
    pub job_id: JobId,
    pub fire_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> TimeDelta {
        TimeDelta::minutes(n)
    }

    #[test]
    fn interval_advance_skips_missed_firings() {
        let trigger = Trigger::every(Duration::from_secs(60));
        // Due at T+1, evaluated at T+5 (down for 4 minutes).
        let next = trigger.advance(t0() + minutes(1), t0() + minutes(5));
        assert_eq!(next, Some(t0() + minutes(6)));
    }

    #[test]
    fn interval_advance_is_strictly_after_now() {
        let trigger = Trigger::every(Duration::from_secs(60));
        assert_eq!(trigger.advance(t0(), t0()), Some(t0() + minutes(1)));
        assert_eq!(
            trigger.advance(t0(), t0() + minutes(1)),
            Some(t0() + minutes(2))
        );
    }

    #[test]
    fn once_is_exhausted_after_firing() {
        let trigger = Trigger::once(t0());
        assert_eq!(trigger.first_fire(t0() - minutes(10)), Some(t0()));
        assert_eq!(trigger.advance(t0(), t0()), None);
    }

    #[test]
    fn cron_advance_uses_now() {
        let trigger = Trigger::cron("*/10 * * * *");
        let next = trigger.advance(t0(), t0() + minutes(25));
        assert_eq!(next, Some(t0() + minutes(30)));
    }

    #[test]
    fn invalid_triggers_are_rejected() {
        assert!(Trigger::every(Duration::ZERO).validate().is_err());
        assert!(Trigger::cron("not a cron").validate().is_err());
        assert!(Trigger::cron("0 * * * *").validate().is_ok());
    }

    #[test]
    fn merge_keeps_firing_state_when_trigger_unchanged() {
        let id = ScheduleId::from_ulid(Ulid::new());
        let template = JobTemplate::new("q", "echo", json!({}));
        let trigger = Trigger::every(Duration::from_secs(60));
        let mut stored = Schedule::new(id, "tick", trigger.clone(), template.clone(), t0());
        stored.next_fire_at = Some(t0() + minutes(3));

        let incoming = Schedule::new(
            ScheduleId::from_ulid(Ulid::new()),
            "tick",
            trigger,
            JobTemplate::new("q", "echo", json!({"v": 2})),
            t0() + minutes(2),
        );
        stored.merge_definition(incoming);
        assert_eq!(stored.id, id);
        assert_eq!(stored.next_fire_at, Some(t0() + minutes(3)));
        assert_eq!(stored.template.payload, json!({"v": 2}));
    }

    #[test]
    fn firing_carries_origin() {
        let id = ScheduleId::from_ulid(Ulid::new());
        let schedule = Schedule::new(
            id,
            "tick",
            Trigger::every(Duration::from_secs(60)),
            JobTemplate::new("q", "echo", json!({})),
            t0(),
        );
        let firing = schedule.firing(t0() + minutes(1), t0() + minutes(1));
        assert_eq!(firing.next_fire_at, Some(t0() + minutes(2)));
        assert_eq!(
            firing.job.origin,
            JobOrigin::Schedule {
                schedule_id: id,
                fire_at: t0() + minutes(1)
            }
        );
    }
}
