//! Attempt history: one record per ended attempt.
//!
//! Records who ran the attempt, what came out of it and what the broker
//! decided, so a dead or failed job can be explained after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::JobError;
use super::ids::WorkerId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed attempt number.
    pub attempt: u32,

    /// Worker that held the lease (None if the attempt never had one).
    pub worker_id: Option<WorkerId>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,

    /// Failure of the attempt; None when it succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,

    /// What the broker did next (`complete`, `retry in 4000ms`, `mark_dead`, ...).
    pub decision: String,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
