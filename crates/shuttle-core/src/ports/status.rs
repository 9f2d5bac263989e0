//! StatusView port - 読み取り専用の観測面
//!
//! キューの深さ、ジョブ単位の状態、worker の heartbeat を返す。
//! 書き込みは一切しない。

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BrokerError, Job, JobState, WorkerId};

/// Per-queue job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    /// Queued and leasable right now (no pending backoff).
    pub ready: u64,
    pub scheduled: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn record(&mut self, state: JobState, ready: bool) {
        self.add(state, 1, u64::from(ready));
    }

    /// Add `count` jobs in `state`, `ready` of which are leasable now.
    pub fn add(&mut self, state: JobState, count: u64, ready: u64) {
        match state {
            JobState::Queued => {
                self.queued += count;
                self.ready += ready;
            }
            JobState::Scheduled => self.scheduled += count,
            JobState::Running => self.running += count,
            JobState::Succeeded => self.succeeded += count,
            JobState::Failed => self.failed += count,
            JobState::Dead => self.dead += count,
        }
    }

    /// Jobs not yet in a terminal state.
    pub fn pending(&self) -> u64 {
        self.queued + self.scheduled + self.running
    }
}

/// Liveness record of one worker unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub queues: Vec<String>,
    pub slots: u32,
    /// Slots currently executing a job.
    pub busy: u32,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub state: Option<JobState>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            queue: None,
            state: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.queue.as_deref().is_none_or(|q| q == job.queue)
            && self.state.is_none_or(|s| s == job.state)
    }
}

#[async_trait]
pub trait StatusView: Send + Sync {
    /// Counts keyed by queue name.
    async fn queue_stats(&self) -> Result<BTreeMap<String, QueueStats>, BrokerError>;

    /// Matching jobs in enqueue order, at most `filter.limit`.
    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, BrokerError>;

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>, BrokerError>;
}
