//! Domain model (ids, job records, schedules, outcomes, decisions, ...).
//!
//! Pure types and transition rules only. Nothing here performs I/O; broker
//! backends persist these types and call their transition methods.

pub mod attempt;
pub mod cron;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod retry;
pub mod schedule;
pub mod spec;
pub mod time;

pub use attempt::AttemptRecord;
pub use cron::{CronError, CronExpr};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{BrokerError, FailureKind, JobError, ValidationError};
pub use ids::{JobId, ParseIdError, ScheduleId, WorkerId};
pub use job::{Job, JobState, Lease};
pub use outcome::Outcome;
pub use retry::RetryPolicy;
pub use schedule::{Fired, JobTemplate, Schedule, ScheduleFiring, Trigger};
pub use spec::{JobDefaults, JobOrigin, JobSpec};
