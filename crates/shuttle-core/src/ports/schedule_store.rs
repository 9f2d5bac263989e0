//! ScheduleStore port - スケジュールの永続化
//!
//! 発火（fire_schedule）はジョブの enqueue と `next_fire_at` の更新を
//! 同一トランザクションで行う。これにより 1 回の発火につきジョブは高々 1 つ。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{BrokerError, JobId, Schedule, ScheduleFiring, ScheduleId};

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert by name, or merge into the existing schedule of that name.
    async fn upsert_schedule(&self, schedule: Schedule) -> Result<Schedule, BrokerError>;

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, BrokerError>;

    /// All schedules ordered by name.
    async fn list_schedules(&self) -> Result<Vec<Schedule>, BrokerError>;

    async fn remove_schedule(&self, id: ScheduleId) -> Result<(), BrokerError>;

    /// Enabled schedules whose `next_fire_at <= now`.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, BrokerError>;

    /// Apply one firing atomically.
    ///
    /// Returns None (and enqueues nothing) when the stored `next_fire_at` no
    /// longer equals `firing.fire_at`, i.e. the firing was already applied.
    async fn fire_schedule(&self, firing: ScheduleFiring) -> Result<Option<JobId>, BrokerError>;
}
