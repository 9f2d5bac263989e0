//! SqliteBroker - ファイルに永続化する broker
//!
//! # 実装詳細
//! - rusqlite (bundled SQLite)、WAL ジャーナル + `synchronous=FULL`
//!   （commit が返った時点で fsync 済み。enqueue が返ったジョブは電源断でも残る）
//! - 書き込みは全て `BEGIN IMMEDIATE` トランザクション：複数プロセスが同じ
//!   DB ファイルを共有しても lease_next が二重に lease しない
//! - ジョブ本体は JSON (`body`) で保存し、検索に使う列だけを別カラムに持つ
//! - rusqlite は同期 API なので、呼び出しは `spawn_blocking` で包む

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tokio::sync::Notify;

use super::BrokerOptions;
use crate::domain::time::{self, to_millis};
use crate::domain::{
    BrokerError, Decider, Job, JobDefaults, JobError, JobId, JobSpec, JobState, Outcome, Schedule,
    ScheduleFiring, ScheduleId, WorkerId,
};
use crate::ports::{
    Broker, Clock, IdGenerator, JobFilter, QueueStats, ScheduleStore, StatusView, UlidGenerator,
    WorkerHeartbeat,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    queue TEXT NOT NULL,
    state TEXT NOT NULL,              -- queued, scheduled, running, succeeded, failed, dead
    exclusive INTEGER NOT NULL DEFAULT 0,
    enqueued_at INTEGER NOT NULL,     -- unix ms
    scheduled_for INTEGER,            -- unix ms
    lease_expires_at INTEGER,         -- unix ms, set while running
    body TEXT NOT NULL                -- JSON job record
);
CREATE INDEX IF NOT EXISTS jobs_lease_order ON jobs(queue, state, enqueued_at, seq);
CREATE INDEX IF NOT EXISTS jobs_running ON jobs(state, lease_expires_at);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1,
    next_fire_at INTEGER,             -- unix ms, NULL once exhausted
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
    worker_id TEXT PRIMARY KEY,
    last_seen INTEGER NOT NULL,
    body TEXT NOT NULL
);
";

/// `.storage()?` for anything whose error is only worth a message.
trait StorageResult<T> {
    fn storage(self) -> Result<T, BrokerError>;
}

impl<T, E: fmt::Display> StorageResult<T> for Result<T, E> {
    fn storage(self) -> Result<T, BrokerError> {
        self.map_err(BrokerError::storage)
    }
}

/// Durable Broker + ScheduleStore + StatusView.
pub struct SqliteBroker {
    conn: Arc<Mutex<Connection>>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    decider: Arc<dyn Decider>,
    defaults: JobDefaults,
}

impl SqliteBroker {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, options: BrokerOptions) -> Result<Self, BrokerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).storage()?;
        }
        let conn = Connection::open(path).storage()?;
        Self::from_connection(conn, options)
    }

    /// Private, non-durable database (tests).
    pub fn open_in_memory(options: BrokerOptions) -> Result<Self, BrokerError> {
        Self::from_connection(Connection::open_in_memory().storage()?, options)
    }

    fn from_connection(conn: Connection, options: BrokerOptions) -> Result<Self, BrokerError> {
        conn.busy_timeout(Duration::from_secs(5)).storage()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .storage()?;
        conn.pragma_update(None, "synchronous", "FULL").storage()?;
        conn.execute_batch(SCHEMA).storage()?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Notify::new(),
            ids: UlidGenerator::new(options.clock.clone()),
            clock: options.clock,
            decider: options.decider,
            defaults: options.defaults,
        })
    }

    /// Run `f` on the connection in the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, BrokerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, BrokerError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| BrokerError::Storage("connection mutex poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .storage()?
    }
}

// ─── Row helpers ──────────────────────────────────────

fn decode<T: serde::de::DeserializeOwned>(body: String) -> Result<T, BrokerError> {
    serde_json::from_str(&body).storage()
}

fn lease_expiry_ms(job: &Job) -> Option<i64> {
    job.lease.as_ref().map(|l| to_millis(l.expires_at))
}

fn insert_job(conn: &Connection, job: &Job) -> Result<(), BrokerError> {
    conn.execute(
        "INSERT INTO jobs (id, queue, state, exclusive, enqueued_at, scheduled_for, lease_expires_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            job.id.to_string(),
            job.queue,
            job.state.as_str(),
            job.exclusive,
            to_millis(job.enqueued_at),
            job.scheduled_for.map(to_millis),
            lease_expiry_ms(job),
            serde_json::to_string(job).storage()?,
        ],
    )
    .storage()?;
    Ok(())
}

/// Write back a job loaded in the same transaction.
///
/// `expected` is the state the job was read in; the update is conditional on
/// it so a concurrent writer can never be silently overwritten.
fn save_job(conn: &Connection, job: &Job, expected: JobState) -> Result<(), BrokerError> {
    let changed = conn
        .execute(
            "UPDATE jobs
             SET state = ?2, scheduled_for = ?3, lease_expires_at = ?4, body = ?5
             WHERE id = ?1 AND state = ?6",
            params![
                job.id.to_string(),
                job.state.as_str(),
                job.scheduled_for.map(to_millis),
                lease_expiry_ms(job),
                serde_json::to_string(job).storage()?,
                expected.as_str(),
            ],
        )
        .storage()?;
    if changed != 1 {
        return Err(BrokerError::Storage(format!(
            "job {} changed state concurrently",
            job.id
        )));
    }
    Ok(())
}

fn load_job(conn: &Connection, job_id: JobId) -> Result<Option<Job>, BrokerError> {
    conn.query_row(
        "SELECT body FROM jobs WHERE id = ?1",
        params![job_id.to_string()],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .storage()?
    .map(decode)
    .transpose()
}

fn require_job(conn: &Connection, job_id: JobId) -> Result<Job, BrokerError> {
    load_job(conn, job_id)?.ok_or(BrokerError::JobNotFound(job_id))
}

fn query_jobs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Job>, BrokerError> {
    let mut stmt = conn.prepare(sql).storage()?;
    let bodies = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .storage()?
        .collect::<Result<Vec<String>, _>>()
        .storage()?;
    bodies.into_iter().map(decode).collect()
}

fn promote_due(conn: &Connection, now: DateTime<Utc>) -> Result<usize, BrokerError> {
    let due = query_jobs(
        conn,
        "SELECT body FROM jobs WHERE state = 'scheduled' AND scheduled_for <= ?1 ORDER BY seq",
        params![to_millis(now)],
    )?;
    let promoted = due.len();
    for mut job in due {
        if job.promote_if_due(now) {
            save_job(conn, &job, JobState::Scheduled)?;
            tracing::debug!(job_id = %job.id, "scheduled job promoted");
        }
    }
    Ok(promoted)
}

fn load_schedule_by_name(conn: &Connection, name: &str) -> Result<Option<Schedule>, BrokerError> {
    conn.query_row(
        "SELECT body FROM schedules WHERE name = ?1",
        params![name],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .storage()?
    .map(decode)
    .transpose()
}

fn load_schedule(conn: &Connection, id: ScheduleId) -> Result<Option<Schedule>, BrokerError> {
    conn.query_row(
        "SELECT body FROM schedules WHERE id = ?1",
        params![id.to_string()],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .storage()?
    .map(decode)
    .transpose()
}

fn save_schedule(conn: &Connection, schedule: &Schedule) -> Result<(), BrokerError> {
    conn.execute(
        "INSERT INTO schedules (id, name, enabled, next_fire_at, body)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             enabled = excluded.enabled,
             next_fire_at = excluded.next_fire_at,
             body = excluded.body",
        params![
            schedule.id.to_string(),
            schedule.name,
            schedule.enabled,
            schedule.next_fire_at.map(to_millis),
            serde_json::to_string(schedule).storage()?,
        ],
    )
    .storage()?;
    Ok(())
}

fn query_schedules(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Schedule>, BrokerError> {
    let mut stmt = conn.prepare(sql).storage()?;
    let bodies = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .storage()?
        .collect::<Result<Vec<String>, _>>()
        .storage()?;
    bodies.into_iter().map(decode).collect()
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn enqueue(&self, spec: JobSpec) -> Result<JobId, BrokerError> {
        spec.validate()?;
        let job = Job::new(
            self.ids.generate_job_id(),
            spec,
            &self.defaults,
            self.clock.now(),
        );
        let job_id = job.id;
        let state = job.state;

        self.with_conn(move |conn| insert_job(conn, &job)).await?;
        tracing::debug!(job_id = %job_id, state = %state, "job enqueued");

        self.notify.notify_one();
        Ok(job_id)
    }

    async fn lease_next(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lease_duration: Duration,
    ) -> Result<Option<Job>, BrokerError> {
        let now = self.clock.now();
        let queue = queue.to_string();
        let worker_id = worker_id.clone();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage()?;
            promote_due(&tx, now)?;

            let exclusive_busy: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM jobs
                                   WHERE queue = ?1 AND state = 'running' AND exclusive = 1)",
                    params![queue],
                    |row| row.get(0),
                )
                .storage()?;

            let candidate = query_jobs(
                &tx,
                "SELECT body FROM jobs
                 WHERE queue = ?1 AND state = 'queued'
                   AND (scheduled_for IS NULL OR scheduled_for <= ?2)
                   AND (?3 = 0 OR exclusive = 0)
                 ORDER BY enqueued_at, seq
                 LIMIT 1",
                params![queue, to_millis(now), exclusive_busy],
            )?
            .pop();
            let Some(mut job) = candidate else {
                return Ok(None);
            };

            job.start_attempt(worker_id, lease_duration, now);
            save_job(&tx, &job, JobState::Queued)?;
            tx.commit().storage()?;
            Ok(Some(job))
        })
        .await
    }

    async fn renew_lease(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<DateTime<Utc>, BrokerError> {
        let now = self.clock.now();
        let worker_id = worker_id.clone();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage()?;
            let mut job = require_job(&tx, job_id)?;
            let expires_at = job.renew_lease(&worker_id, now)?;
            save_job(&tx, &job, JobState::Running)?;
            tx.commit().storage()?;
            Ok(expires_at)
        })
        .await
    }

    async fn report(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        outcome: Outcome,
    ) -> Result<JobState, BrokerError> {
        let now = self.clock.now();
        let worker_id = worker_id.clone();
        let decider = self.decider.clone();

        let (state, label) = self
            .with_conn(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .storage()?;
                let mut job = require_job(&tx, job_id)?;
                job.ensure_owned_by(&worker_id)?;
                let decision = job.conclude_attempt(outcome, decider.as_ref(), now);
                save_job(&tx, &job, JobState::Running)?;
                tx.commit().storage()?;
                Ok((job.state, decision.label()))
            })
            .await?;

        tracing::debug!(job_id = %job_id, decision = %label, "attempt reported");
        if state == JobState::Queued {
            self.notify.notify_one();
        }
        Ok(state)
    }

    async fn reap_expired_leases(&self) -> Result<Vec<JobId>, BrokerError> {
        let now = self.clock.now();
        let decider = self.decider.clone();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage()?;
            let expired = query_jobs(
                &tx,
                "SELECT body FROM jobs
                 WHERE state = 'running' AND lease_expires_at <= ?1
                 ORDER BY seq",
                params![to_millis(now)],
            )?;

            let mut reaped = Vec::with_capacity(expired.len());
            for mut job in expired {
                job.conclude_attempt(
                    Outcome::RetryableFailure(JobError::lease_expired()),
                    decider.as_ref(),
                    now,
                );
                save_job(&tx, &job, JobState::Running)?;
                reaped.push(job.id);
            }
            tx.commit().storage()?;
            Ok(reaped)
        })
        .await
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), BrokerError> {
        let now = self.clock.now();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage()?;
            let mut job = require_job(&tx, job_id)?;
            let before = job.state;
            job.cancel(now)?;
            save_job(&tx, &job, before)?;
            tx.commit().storage()
        })
        .await
    }

    async fn retry_dead(&self, job_id: JobId) -> Result<(), BrokerError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage()?;
            let mut job = require_job(&tx, job_id)?;
            let before = job.state;
            job.revive()?;
            save_job(&tx, &job, before)?;
            tx.commit().storage()
        })
        .await?;

        self.notify.notify_one();
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        self.with_conn(move |conn| load_job(conn, job_id)).await
    }

    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<(), BrokerError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO workers (worker_id, last_seen, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(worker_id) DO UPDATE SET
                     last_seen = excluded.last_seen,
                     body = excluded.body",
                params![
                    heartbeat.worker_id.as_str(),
                    to_millis(heartbeat.last_seen),
                    serde_json::to_string(&heartbeat).storage()?,
                ],
            )
            .storage()?;
            Ok(())
        })
        .await
    }

    async fn retire_worker(&self, worker_id: &WorkerId) -> Result<(), BrokerError> {
        let worker_id = worker_id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM workers WHERE worker_id = ?1",
                params![worker_id.as_str()],
            )
            .storage()?;
            Ok(())
        })
        .await
    }

    async fn prune_workers(&self, retention: Duration) -> Result<Vec<WorkerId>, BrokerError> {
        let cutoff = to_millis(time::sub(self.clock.now(), retention));
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("DELETE FROM workers WHERE last_seen < ?1 RETURNING worker_id")
                .storage()?;
            let pruned = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))
                .storage()?
                .map(|id| id.map(WorkerId::new).storage())
                .collect::<Result<Vec<_>, _>>()?;
            Ok(pruned)
        })
        .await
    }

    async fn wait_for_work(&self, timeout: Duration) {
        // Wakes early for work enqueued by this process; other processes
        // are only seen on the next poll.
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

#[async_trait]
impl ScheduleStore for SqliteBroker {
    async fn upsert_schedule(&self, schedule: Schedule) -> Result<Schedule, BrokerError> {
        schedule.validate()?;
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .storage()?;
            let stored = match load_schedule_by_name(&tx, &schedule.name)? {
                Some(mut current) => {
                    current.merge_definition(schedule);
                    current
                }
                None => schedule,
            };
            save_schedule(&tx, &stored)?;
            tx.commit().storage()?;
            Ok(stored)
        })
        .await
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, BrokerError> {
        self.with_conn(move |conn| load_schedule(conn, id)).await
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, BrokerError> {
        self.with_conn(|conn| {
            query_schedules(conn, "SELECT body FROM schedules ORDER BY name", [])
        })
        .await
    }

    async fn remove_schedule(&self, id: ScheduleId) -> Result<(), BrokerError> {
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM schedules WHERE id = ?1", params![id.to_string()])
                .storage()?;
            if removed == 0 {
                return Err(BrokerError::ScheduleNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, BrokerError> {
        self.with_conn(move |conn| {
            query_schedules(
                conn,
                "SELECT body FROM schedules
                 WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?1
                 ORDER BY next_fire_at, name",
                params![to_millis(now)],
            )
        })
        .await
    }

    async fn fire_schedule(&self, firing: ScheduleFiring) -> Result<Option<JobId>, BrokerError> {
        firing.job.validate()?;
        let now = self.clock.now();
        let job_id = self.ids.generate_job_id();
        let defaults = self.defaults.clone();

        let fired = self
            .with_conn(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .storage()?;
                let mut schedule = load_schedule(&tx, firing.schedule_id)?
                    .ok_or(BrokerError::ScheduleNotFound(firing.schedule_id))?;
                if schedule.next_fire_at != Some(firing.fire_at) {
                    return Ok(None);
                }

                let job = Job::new(job_id, firing.job, &defaults, now);
                insert_job(&tx, &job)?;

                schedule.last_fired_at = Some(firing.fire_at);
                schedule.next_fire_at = firing.next_fire_at;
                if firing.next_fire_at.is_none() {
                    schedule.enabled = false;
                }
                save_schedule(&tx, &schedule)?;
                tx.commit().storage()?;
                Ok(Some(job_id))
            })
            .await?;

        if fired.is_some() {
            self.notify.notify_one();
        }
        Ok(fired)
    }
}

#[async_trait]
impl StatusView for SqliteBroker {
    async fn queue_stats(&self) -> Result<BTreeMap<String, QueueStats>, BrokerError> {
        let now = to_millis(self.clock.now());
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT queue, state, COUNT(*),
                            SUM(CASE WHEN scheduled_for IS NULL OR scheduled_for <= ?1
                                     THEN 1 ELSE 0 END)
                     FROM jobs GROUP BY queue, state",
                )
                .storage()?;
            let rows = stmt
                .query_map(params![now], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .storage()?
                .collect::<Result<Vec<_>, _>>()
                .storage()?;

            let mut stats: BTreeMap<String, QueueStats> = BTreeMap::new();
            for (queue, state, count, ready) in rows {
                let state: JobState = state.parse().map_err(BrokerError::Storage)?;
                stats.entry(queue).or_default().add(
                    state,
                    u64::try_from(count).unwrap_or(0),
                    u64::try_from(ready).unwrap_or(0),
                );
            }
            Ok(stats)
        })
        .await
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, BrokerError> {
        self.with_conn(move |conn| {
            query_jobs(
                conn,
                "SELECT body FROM jobs
                 WHERE (?1 IS NULL OR queue = ?1) AND (?2 IS NULL OR state = ?2)
                 ORDER BY seq
                 LIMIT ?3",
                params![
                    filter.queue,
                    filter.state.map(JobState::as_str),
                    i64::try_from(filter.limit).unwrap_or(i64::MAX),
                ],
            )
        })
        .await
    }

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>, BrokerError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT body FROM workers ORDER BY worker_id")
                .storage()?;
            let bodies = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .storage()?
                .collect::<Result<Vec<String>, _>>()
                .storage()?;
            bodies.into_iter().map(decode).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn setup() -> (SqliteBroker, FixedClock) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let options = BrokerOptions::default().with_clock(Arc::new(clock.clone()));
        (SqliteBroker::open_in_memory(options).unwrap(), clock)
    }

    #[tokio::test]
    async fn commits_are_fully_synced() {
        let dir = tempfile::tempdir().unwrap();
        let broker = SqliteBroker::open(&dir.path().join("jobs.db"), BrokerOptions::default()).unwrap();
        let (journal, synchronous) = broker
            .with_conn(|conn| {
                let journal: String = conn
                    .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .storage()?;
                let synchronous: i64 = conn
                    .query_row("PRAGMA synchronous", [], |row| row.get(0))
                    .storage()?;
                Ok((journal, synchronous))
            })
            .await
            .unwrap();
        assert_eq!(journal, "wal");
        // 2 = FULL
        assert_eq!(synchronous, 2);
    }

    #[tokio::test]
    async fn job_body_roundtrips_through_storage() {
        let (broker, _clock) = setup();
        let spec = JobSpec::new("q", "echo", json!({"msg": "hi"}))
            .with_max_attempts(2)
            .with_timeout(Duration::from_millis(1500));
        let id = broker.enqueue(spec).await.unwrap();

        let job = broker.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.payload, json!({"msg": "hi"}));
        assert_eq!(job.max_attempts, 2);
        assert_eq!(job.timeout, Duration::from_millis(1500));
        assert_eq!(job.state, JobState::Queued);
    }

    #[tokio::test]
    async fn promotion_updates_indexed_state() {
        let (broker, clock) = setup();
        let at = clock.now() + chrono::TimeDelta::seconds(30);
        let id = broker
            .enqueue(JobSpec::new("q", "echo", json!({})).scheduled_for(at))
            .await
            .unwrap();

        let stats = broker.queue_stats().await.unwrap();
        assert_eq!(stats["q"].scheduled, 1);

        clock.advance(Duration::from_secs(30));
        let leased = broker
            .lease_next("q", &WorkerId::new("w"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(leased.map(|j| j.id), Some(id));

        let stats = broker.queue_stats().await.unwrap();
        assert_eq!(stats["q"].running, 1);
        assert_eq!(stats["q"].scheduled, 0);
    }

    #[tokio::test]
    async fn list_jobs_filters_by_state() {
        let (broker, _clock) = setup();
        let a = broker.enqueue(JobSpec::new("q", "echo", json!(1))).await.unwrap();
        let b = broker.enqueue(JobSpec::new("q", "echo", json!(2))).await.unwrap();
        broker.cancel(b).await.unwrap();

        let queued = broker
            .list_jobs(JobFilter {
                state: Some(JobState::Queued),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(queued.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a]);

        let all = broker.list_jobs(JobFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
