//! Scheduler - 時刻トリガでジョブを発行
//!
//! # フロー（tick ごと）
//! 1. `due_schedules(now)` で発火すべきスケジュールを取得
//! 2. 次回時刻を `trigger.advance(fire_at, now)` で計算（必ず now より後）
//! 3. queue の既定値を埋める（Gateway と同じ `QueueTable::prepare`）
//! 4. `fire_schedule` で enqueue と次回時刻の更新を原子的に実行
//!
//! 同時に動く scheduler は 1 つだけ、という前提はデプロイ側で担保する。
//! 仮に 2 つ動いても `fire_schedule` の比較で二重発火にはならない。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{QueueTable, ScheduleDefinition};
use crate::domain::{BrokerError, Fired, Schedule, ValidationError};
use crate::ports::{Clock, IdGenerator, ScheduleStore};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<Fired>,
    /// Firings already applied elsewhere.
    pub skipped: usize,
    pub failed: usize,
}

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    queues: QueueTable,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            queues: QueueTable::default(),
            tick_interval,
        }
    }

    /// Apply per-queue defaults to emitted jobs and reject schedules whose
    /// queue is not configured.
    pub fn with_queues(mut self, queues: QueueTable) -> Self {
        self.queues = queues;
        self
    }

    /// Upsert configured schedules; existing ones keep their firing state.
    pub async fn register(
        &self,
        definitions: &[ScheduleDefinition],
    ) -> Result<Vec<Schedule>, BrokerError> {
        let now = self.clock.now();
        let mut registered = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if !self.queues.contains(&definition.queue) {
                return Err(ValidationError::UnknownQueue(definition.queue.clone()).into());
            }
            let schedule = definition.to_schedule(self.ids.generate_schedule_id(), now)?;
            let stored = self.store.upsert_schedule(schedule).await?;
            tracing::info!(
                schedule = %stored.name,
                schedule_id = %stored.id,
                next_fire_at = ?stored.next_fire_at,
                "schedule registered"
            );
            registered.push(stored);
        }
        Ok(registered)
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let due = match self.store.due_schedules(now).await {
            Ok(due) => due,
            Err(err) => {
                tracing::error!(error = %err, "failed to load due schedules");
                report.failed += 1;
                return report;
            }
        };

        for schedule in due {
            let Some(fire_at) = schedule.next_fire_at else {
                continue;
            };
            let mut firing = schedule.firing(fire_at, now);
            firing.job = match self.queues.prepare(firing.job) {
                Ok(job) => job,
                Err(err) => {
                    tracing::error!(schedule = %schedule.name, error = %err, "schedule targets an unusable queue");
                    report.failed += 1;
                    continue;
                }
            };
            let next_fire_at = firing.next_fire_at;

            match self.store.fire_schedule(firing).await {
                Ok(Some(job_id)) => {
                    tracing::info!(
                        schedule = %schedule.name,
                        job_id = %job_id,
                        %fire_at,
                        next_fire_at = ?next_fire_at,
                        "schedule fired"
                    );
                    report.fired.push(Fired {
                        schedule_id: schedule.id,
                        job_id,
                        fire_at,
                    });
                }
                Ok(None) => {
                    tracing::debug!(schedule = %schedule.name, %fire_at, "firing already applied");
                    report.skipped += 1;
                }
                Err(err) => {
                    tracing::error!(schedule = %schedule.name, error = %err, "schedule firing failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Tick on a steady cadence until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(tick_ms = self.tick_interval.as_millis() as u64, "scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(self.clock.now()).await;
                }
            }
        }
        tracing::info!("scheduler stopped");
    }
}
