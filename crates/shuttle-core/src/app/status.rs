//! Status - 観測用のスナップショット
//!
//! queue ごとの件数、worker の heartbeat（stale 判定付き）、
//! 実行中ジョブの lease をまとめて返す。JSON にも表にも出せる。

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{BrokerError, JobId, JobState, WorkerId, time};
use crate::ports::{JobFilter, QueueStats, StatusView, WorkerHeartbeat};

/// Heartbeats older than this many intervals mark a worker stale.
const STALE_AFTER_INTERVALS: u32 = 3;

/// Upper bound on leases listed in one report.
const MAX_LEASES: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub heartbeat: WorkerHeartbeat,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseStatus {
    pub job_id: JobId,
    pub queue: String,
    pub kind: String,
    pub worker_id: WorkerId,
    pub attempt: u32,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub queues: BTreeMap<String, QueueStats>,
    pub workers: Vec<WorkerStatus>,
    pub leases: Vec<LeaseStatus>,
}

impl StatusReport {
    pub async fn collect(
        view: &dyn StatusView,
        now: DateTime<Utc>,
        heartbeat_interval: Duration,
    ) -> Result<Self, BrokerError> {
        let queues = view.queue_stats().await?;

        let stale_after = heartbeat_interval * STALE_AFTER_INTERVALS;
        let workers = view
            .workers()
            .await?
            .into_iter()
            .map(|heartbeat| WorkerStatus {
                stale: time::add(heartbeat.last_seen, stale_after) < now,
                heartbeat,
            })
            .collect();

        let running = view
            .list_jobs(JobFilter {
                state: Some(JobState::Running),
                limit: MAX_LEASES,
                ..JobFilter::default()
            })
            .await?;
        let leases = running
            .into_iter()
            .filter_map(|job| {
                let lease = job.lease?;
                Some(LeaseStatus {
                    job_id: job.id,
                    queue: job.queue,
                    kind: job.kind,
                    worker_id: lease.worker_id,
                    attempt: job.attempt_count + 1,
                    expires_at: lease.expires_at,
                    expired: lease.expires_at <= now,
                })
            })
            .collect();

        Ok(Self {
            generated_at: now,
            queues,
            workers,
            leases,
        })
    }
}

/// Plain-text table for terminals.
impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<20} {:>7} {:>7} {:>9} {:>7} {:>9} {:>7} {:>7}",
            "QUEUE", "QUEUED", "READY", "SCHEDULED", "RUNNING", "SUCCEEDED", "FAILED", "DEAD"
        )?;
        for (name, s) in &self.queues {
            writeln!(
                f,
                "{:<20} {:>7} {:>7} {:>9} {:>7} {:>9} {:>7} {:>7}",
                name, s.queued, s.ready, s.scheduled, s.running, s.succeeded, s.failed, s.dead
            )?;
        }

        writeln!(f)?;
        writeln!(f, "{:<32} {:>5} {:>5} LAST SEEN", "WORKER", "SLOTS", "BUSY")?;
        for w in &self.workers {
            writeln!(
                f,
                "{:<32} {:>5} {:>5} {:<24} {}",
                w.heartbeat.worker_id.as_str(),
                w.heartbeat.slots,
                w.heartbeat.busy,
                w.heartbeat.last_seen.format("%Y-%m-%d %H:%M:%S"),
                if w.stale { "stale" } else { "" }
            )?;
        }

        if !self.leases.is_empty() {
            writeln!(f)?;
            writeln!(f, "{:<32} {:<16} {:<36} {:>7} EXPIRES", "JOB", "QUEUE", "WORKER", "ATTEMPT")?;
            for l in &self.leases {
                writeln!(
                    f,
                    "{:<32} {:<16} {:<36} {:>7} {}{}",
                    l.job_id.to_string(),
                    l.queue,
                    l.worker_id.as_str(),
                    l.attempt,
                    l.expires_at.format("%H:%M:%S%.3f"),
                    if l.expired { " (expired)" } else { "" }
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobSpec;
    use crate::impls::{BrokerOptions, MemoryBroker};
    use crate::ports::{Broker, FixedClock};
    use chrono::{TimeDelta, TimeZone};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn report_flags_stale_workers_and_lists_leases() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = FixedClock::new(t0);
        let broker = MemoryBroker::new(BrokerOptions::default().with_clock(Arc::new(clock.clone())));

        broker.enqueue(JobSpec::new("q", "echo", json!({}))).await.unwrap();
        broker.enqueue(JobSpec::new("q", "echo", json!({}))).await.unwrap();
        broker
            .lease_next("q", &WorkerId::new("w.s0"), Duration::from_secs(30))
            .await
            .unwrap();

        for (id, last_seen) in [("fresh", t0), ("gone", t0 - TimeDelta::seconds(60))] {
            broker
                .heartbeat(WorkerHeartbeat {
                    worker_id: WorkerId::new(id),
                    queues: vec!["q".to_string()],
                    slots: 1,
                    busy: 0,
                    started_at: t0 - TimeDelta::hours(1),
                    last_seen,
                })
                .await
                .unwrap();
        }

        let report = StatusReport::collect(&broker, t0, Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.queues["q"].queued, 1);
        assert_eq!(report.queues["q"].running, 1);

        let stale: Vec<(&str, bool)> = report
            .workers
            .iter()
            .map(|w| (w.heartbeat.worker_id.as_str(), w.stale))
            .collect();
        assert_eq!(stale, vec![("fresh", false), ("gone", true)]);

        assert_eq!(report.leases.len(), 1);
        assert_eq!(report.leases[0].worker_id, WorkerId::new("w.s0"));
        assert!(!report.leases[0].expired);

        let table = report.to_string();
        assert!(table.contains("QUEUE"));
        assert!(table.contains("stale"));

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["workers"][1]["stale"], true);
        assert_eq!(value["workers"][1]["worker_id"], "gone");
    }
}
