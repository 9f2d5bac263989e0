//! Broker port - ジョブの正本（source of truth）
//!
//! Broker は以下を管理します：
//! - 待機中ジョブ・未来にスケジュールされたジョブ
//! - 実行中ジョブの lease
//! - 終端状態（succeeded / failed / dead）の記録
//! - worker の heartbeat
//!
//! # 設計原則
//! - ジョブの中身は実行しない（状態遷移だけを担う）
//! - `lease_next` は原子的：1 つのジョブに 2 つの lease が同時に存在しない
//! - 状態遷移のルールは `domain::Job` に集約し、実装は永続化だけを担う

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{BrokerError, Job, JobId, JobSpec, JobState, Outcome, WorkerId};
use crate::ports::status::WorkerHeartbeat;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Validate and persist a new job. The id is assigned here.
    async fn enqueue(&self, spec: JobSpec) -> Result<JobId, BrokerError>;

    /// Lease the oldest eligible job of `queue` for `worker_id`.
    ///
    /// Promotes due scheduled jobs first. Returns None when nothing is
    /// eligible (including when every candidate is exclusive and another
    /// exclusive job of the queue is already running).
    async fn lease_next(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lease_duration: Duration,
    ) -> Result<Option<Job>, BrokerError>;

    /// Extend the lease by its own duration and return the new expiry.
    ///
    /// Fails with `LeaseExpired` once the job is no longer running under
    /// `worker_id` (reaped, reassigned or already reported).
    async fn renew_lease(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<DateTime<Utc>, BrokerError>;

    /// Record the outcome of the current attempt and return the new state.
    async fn report(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        outcome: Outcome,
    ) -> Result<JobState, BrokerError>;

    /// Treat every running job with an expired lease as a retryable failure.
    async fn reap_expired_leases(&self) -> Result<Vec<JobId>, BrokerError>;

    /// Queued | Scheduled -> Dead.
    async fn cancel(&self, job_id: JobId) -> Result<(), BrokerError>;

    /// Dead | Failed -> Queued with a fresh attempt budget.
    async fn retry_dead(&self, job_id: JobId) -> Result<(), BrokerError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError>;

    /// Upsert the liveness record of one worker unit.
    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<(), BrokerError>;

    /// Drop the liveness record of a unit that stopped cleanly.
    async fn retire_worker(&self, worker_id: &WorkerId) -> Result<(), BrokerError>;

    /// Drop liveness records not refreshed within `retention`.
    async fn prune_workers(&self, retention: Duration) -> Result<Vec<WorkerId>, BrokerError>;

    /// Suspend an idle worker for at most `timeout`.
    ///
    /// Backends that can observe new work may return early.
    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}
