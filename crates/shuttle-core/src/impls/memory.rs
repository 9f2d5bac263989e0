//! MemoryBroker - 開発・テスト用の in-process broker
//!
//! # 実装詳細
//! - `tokio::sync::Mutex` で状態全体を排他制御（lease の原子性はこれで担保）
//! - queue ごとの ready 集合は (enqueued_at, seq) 順の BTreeSet
//! - backoff 中 / 未来にスケジュールされたジョブは min-heap で保持し、
//!   lease_next の直前に期限が来たものを ready へ昇格
//! - enqueue / requeue 時に `Notify` で待機中の worker を起こす
//!
//! 永続化はしない。プロセスが落ちれば全て消える。

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use super::BrokerOptions;
use crate::domain::{
    BrokerError, Decider, Job, JobDefaults, JobError, JobId, JobSpec, JobState, Outcome, Schedule,
    ScheduleFiring, ScheduleId, WorkerId, time,
};
use crate::ports::{
    Broker, Clock, IdGenerator, JobFilter, QueueStats, ScheduleStore, StatusView, UlidGenerator,
    WorkerHeartbeat,
};

/// Key of a leasable job inside its queue's ready set.
type ReadyKey = (DateTime<Utc>, u64, JobId);

/// Job waiting for `at` (retry backoff or `scheduled_for`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delayed {
    at: DateTime<Utc>,
    seq: u64,
    job_id: JobId,
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct Entry {
    seq: u64,
    job: Job,
}

impl Entry {
    fn ready_key(&self) -> ReadyKey {
        (self.job.enqueued_at, self.seq, self.job.id)
    }
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Entry>,
    ready: HashMap<String, BTreeSet<ReadyKey>>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    /// Running exclusive job per queue.
    exclusive_running: HashMap<String, JobId>,
    schedules: HashMap<ScheduleId, Schedule>,
    workers: BTreeMap<WorkerId, WorkerHeartbeat>,
    next_seq: u64,
}

impl MemoryState {
    fn insert_job(&mut self, job: Job, now: DateTime<Utc>) -> JobId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = job.id;
        self.jobs.insert(id, Entry { seq, job });
        self.place(id, now);
        id
    }

    /// Put a queued/scheduled job where lease_next will find it.
    fn place(&mut self, job_id: JobId, now: DateTime<Utc>) {
        let Some(entry) = self.jobs.get(&job_id) else {
            return;
        };
        let job = &entry.job;
        match job.state {
            JobState::Queued if job.is_eligible(now) => {
                let key = entry.ready_key();
                self.ready.entry(job.queue.clone()).or_default().insert(key);
            }
            JobState::Queued | JobState::Scheduled => {
                if let Some(at) = job.scheduled_for {
                    self.delayed.push(Reverse(Delayed {
                        at,
                        seq: entry.seq,
                        job_id,
                    }));
                }
            }
            _ => {}
        }
    }

    fn unplace(&mut self, job_id: JobId) {
        if let Some(entry) = self.jobs.get(&job_id)
            && let Some(set) = self.ready.get_mut(&entry.job.queue)
        {
            set.remove(&entry.ready_key());
        }
    }

    /// Move due delayed jobs into their ready sets.
    ///
    /// Heap entries can be stale (job cancelled, leased or re-delayed since);
    /// those are dropped here.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse(entry)) = self.delayed.peek() {
            if entry.at > now {
                break;
            }
            let job_id = entry.job_id;
            self.delayed.pop();

            let Some(stored) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if stored.job.promote_if_due(now) {
                tracing::debug!(job_id = %job_id, "scheduled job promoted");
            }
            if stored.job.is_eligible(now) {
                let key = stored.ready_key();
                self.ready
                    .entry(stored.job.queue.clone())
                    .or_default()
                    .insert(key);
            }
        }
    }

    fn release_exclusive(&mut self, job: &Job) {
        if job.exclusive && self.exclusive_running.get(&job.queue) == Some(&job.id) {
            self.exclusive_running.remove(&job.queue);
        }
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, BrokerError> {
        self.jobs
            .get_mut(&job_id)
            .map(|entry| &mut entry.job)
            .ok_or(BrokerError::JobNotFound(job_id))
    }
}

/// In-memory Broker + ScheduleStore + StatusView.
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    decider: Arc<dyn Decider>,
    defaults: JobDefaults,
}

impl MemoryBroker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            notify: Arc::new(Notify::new()),
            ids: UlidGenerator::new(options.clock.clone()),
            clock: options.clock,
            decider: options.decider,
            defaults: options.defaults,
        }
    }

    fn wake(&self, count: usize) {
        for _ in 0..count {
            self.notify.notify_one();
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerOptions::default())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, spec: JobSpec) -> Result<JobId, BrokerError> {
        spec.validate()?;
        let now = self.clock.now();
        let job = Job::new(self.ids.generate_job_id(), spec, &self.defaults, now);
        let state_after = job.state;

        let job_id = self.state.lock().await.insert_job(job, now);
        tracing::debug!(job_id = %job_id, state = %state_after, "job enqueued");

        self.wake(1);
        Ok(job_id)
    }

    async fn lease_next(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lease_duration: Duration,
    ) -> Result<Option<Job>, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.promote_due(now);

        let exclusive_busy = state.exclusive_running.contains_key(queue);
        let Some(ready) = state.ready.get(queue) else {
            return Ok(None);
        };
        let picked = ready.iter().copied().find(|(_, _, id)| {
            state
                .jobs
                .get(id)
                .is_some_and(|e| e.job.is_eligible(now) && !(exclusive_busy && e.job.exclusive))
        });
        let Some(key) = picked else {
            return Ok(None);
        };

        if let Some(set) = state.ready.get_mut(queue) {
            set.remove(&key);
        }
        let job = state.job_mut(key.2)?;
        job.start_attempt(worker_id.clone(), lease_duration, now);
        let leased = job.clone();
        if leased.exclusive {
            state.exclusive_running.insert(leased.queue.clone(), leased.id);
        }
        Ok(Some(leased))
    }

    async fn renew_lease(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<DateTime<Utc>, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.job_mut(job_id)?.renew_lease(worker_id, now)
    }

    async fn report(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        outcome: Outcome,
    ) -> Result<JobState, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let job = state.job_mut(job_id)?;
        job.ensure_owned_by(worker_id)?;
        let decision = job.conclude_attempt(outcome, self.decider.as_ref(), now);
        let job = job.clone();

        state.release_exclusive(&job);
        state.place(job_id, now);
        drop(state);

        tracing::debug!(job_id = %job_id, decision = %decision.label(), "attempt reported");
        if job.state == JobState::Queued {
            self.wake(1);
        }
        Ok(job.state)
    }

    async fn reap_expired_leases(&self) -> Result<Vec<JobId>, BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let mut expired: Vec<(u64, JobId)> = state
            .jobs
            .values()
            .filter(|e| e.job.lease_expired(now))
            .map(|e| (e.seq, e.job.id))
            .collect();
        expired.sort();

        let mut reaped = Vec::with_capacity(expired.len());
        for (_, job_id) in expired {
            let job = state.job_mut(job_id)?;
            job.conclude_attempt(
                Outcome::RetryableFailure(JobError::lease_expired()),
                self.decider.as_ref(),
                now,
            );
            let job = job.clone();
            state.release_exclusive(&job);
            state.place(job_id, now);
            reaped.push(job_id);
        }
        drop(state);

        self.wake(reaped.len());
        Ok(reaped)
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.unplace(job_id);
        let job = state.job_mut(job_id)?;
        let result = job.cancel(now);
        if result.is_err() {
            // Still queued after all; put it back where it was.
            state.place(job_id, now);
        }
        result
    }

    async fn retry_dead(&self, job_id: JobId) -> Result<(), BrokerError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.job_mut(job_id)?.revive()?;
        state.place(job_id, now);
        drop(state);

        self.wake(1);
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).map(|e| e.job.clone()))
    }

    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.workers.insert(heartbeat.worker_id.clone(), heartbeat);
        Ok(())
    }

    async fn retire_worker(&self, worker_id: &WorkerId) -> Result<(), BrokerError> {
        self.state.lock().await.workers.remove(worker_id);
        Ok(())
    }

    async fn prune_workers(&self, retention: Duration) -> Result<Vec<WorkerId>, BrokerError> {
        let cutoff = time::sub(self.clock.now(), retention);
        let mut state = self.state.lock().await;
        let mut pruned = Vec::new();
        state.workers.retain(|id, heartbeat| {
            let keep = heartbeat.last_seen >= cutoff;
            if !keep {
                pruned.push(id.clone());
            }
            keep
        });
        Ok(pruned)
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

#[async_trait]
impl ScheduleStore for MemoryBroker {
    async fn upsert_schedule(&self, schedule: Schedule) -> Result<Schedule, BrokerError> {
        schedule.validate()?;
        let mut state = self.state.lock().await;

        let existing = state
            .schedules
            .values_mut()
            .find(|s| s.name == schedule.name);
        let stored = match existing {
            Some(current) => {
                current.merge_definition(schedule);
                current.clone()
            }
            None => {
                state.schedules.insert(schedule.id, schedule.clone());
                schedule
            }
        };
        Ok(stored)
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, BrokerError> {
        Ok(self.state.lock().await.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, BrokerError> {
        let state = self.state.lock().await;
        let mut schedules: Vec<Schedule> = state.schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    async fn remove_schedule(&self, id: ScheduleId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .schedules
            .remove(&id)
            .map(|_| ())
            .ok_or(BrokerError::ScheduleNotFound(id))
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, BrokerError> {
        let state = self.state.lock().await;
        let mut due: Vec<Schedule> = state
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_fire_at);
        Ok(due)
    }

    async fn fire_schedule(&self, firing: ScheduleFiring) -> Result<Option<JobId>, BrokerError> {
        firing.job.validate()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let schedule = state
            .schedules
            .get_mut(&firing.schedule_id)
            .ok_or(BrokerError::ScheduleNotFound(firing.schedule_id))?;
        if schedule.next_fire_at != Some(firing.fire_at) {
            return Ok(None);
        }
        schedule.last_fired_at = Some(firing.fire_at);
        schedule.next_fire_at = firing.next_fire_at;
        if firing.next_fire_at.is_none() {
            schedule.enabled = false;
        }

        let job = Job::new(self.ids.generate_job_id(), firing.job, &self.defaults, now);
        let job_id = state.insert_job(job, now);
        drop(state);

        self.wake(1);
        Ok(Some(job_id))
    }
}

#[async_trait]
impl StatusView for MemoryBroker {
    async fn queue_stats(&self) -> Result<BTreeMap<String, QueueStats>, BrokerError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut stats: BTreeMap<String, QueueStats> = BTreeMap::new();
        for entry in state.jobs.values() {
            let job = &entry.job;
            stats
                .entry(job.queue.clone())
                .or_default()
                .record(job.state, job.is_eligible(now));
        }
        Ok(stats)
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, BrokerError> {
        let state = self.state.lock().await;
        let mut entries: Vec<&Entry> = state
            .jobs
            .values()
            .filter(|e| filter.matches(&e.job))
            .collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries
            .into_iter()
            .take(filter.limit)
            .map(|e| e.job.clone())
            .collect())
    }

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>, BrokerError> {
        Ok(self.state.lock().await.workers.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn setup() -> (MemoryBroker, FixedClock) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let options = BrokerOptions::default()
            .with_clock(Arc::new(clock.clone()))
            .with_retry(RetryPolicy::default());
        (MemoryBroker::new(options), clock)
    }

    fn worker() -> WorkerId {
        WorkerId::new("w-1")
    }

    #[test]
    fn delayed_heap_yields_earliest_first() {
        let mut heap = BinaryHeap::new();
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        for (secs, seq) in [(30, 0), (10, 1), (20, 2)] {
            heap.push(Reverse(Delayed {
                at: base + chrono::TimeDelta::seconds(secs),
                seq,
                job_id: JobId::from_ulid(ulid::Ulid::new()),
            }));
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(d)| d.seq)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn retry_backoff_hides_job_until_due() {
        let (broker, clock) = setup();
        let id = broker
            .enqueue(JobSpec::new("q", "echo", json!({})).with_max_attempts(3))
            .await
            .unwrap();

        broker.lease_next("q", &worker(), Duration::from_secs(30)).await.unwrap();
        let state = broker
            .report(id, &worker(), Outcome::RetryableFailure(JobError::retryable("x")))
            .await
            .unwrap();
        assert_eq!(state, JobState::Queued);

        // Default policy: 2s after the first attempt.
        assert!(broker.lease_next("q", &worker(), Duration::from_secs(30)).await.unwrap().is_none());
        clock.advance(Duration::from_secs(2));
        let leased = broker.lease_next("q", &worker(), Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased.map(|j| (j.id, j.current_attempt())), Some((id, 2)));
    }

    #[tokio::test]
    async fn stale_heap_entries_are_ignored() {
        let (broker, clock) = setup();
        let at = clock.now() + chrono::TimeDelta::seconds(5);
        let id = broker
            .enqueue(JobSpec::new("q", "echo", json!({})).scheduled_for(at))
            .await
            .unwrap();
        broker.cancel(id).await.unwrap();

        clock.advance(Duration::from_secs(10));
        assert!(broker.lease_next("q", &worker(), Duration::from_secs(30)).await.unwrap().is_none());
        assert_eq!(broker.get_job(id).await.unwrap().unwrap().state, JobState::Dead);
    }

    #[tokio::test]
    async fn enqueue_wakes_idle_worker() {
        let (broker, _clock) = setup();
        let broker = Arc::new(broker);

        let waiter = tokio::spawn({
            let broker = broker.clone();
            async move {
                let start = tokio::time::Instant::now();
                broker.wait_for_work(Duration::from_secs(5)).await;
                start.elapsed()
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.enqueue(JobSpec::new("q", "echo", json!({}))).await.unwrap();

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
