//! WorkerPool - ジョブ実行ループ
//!
//! # 構成
//! - pool = `units` 個の worker unit
//! - unit = `slots` 個の実行 slot + heartbeat タスク
//! - slot = lease → handler 実行 → report を繰り返す
//!
//! # slot のフロー
//! 1. 設定された queue を優先順に `lease_next`
//! 2. 空なら `wait_for_work` で待つ（poll_min から poll_max まで倍々）
//! 3. handler を blocking pool のスレッドで実行し、slot 側で timeout・lease 更新と select
//! 4. lease を失ったら handler を打ち切り、report はしない（reaper が回収済み）
//! 5. 結果を report
//!
//! handler は runtime の worker thread に載せない。同期的にブロックするジョブが
//! いても、timeout と lease 更新は slot タスク側で必ず動く。打ち切りは
//! cancel token 経由なので、ブロック中の呼び出しそのものは止められず、
//! 戻ってきた時点で結果ごと捨てられる。
//!
//! shutdown は新規 lease を止めるだけ。実行中のジョブは完了まで走らせて report する。
//! unit が止まるとき、自分の heartbeat 記録は消す。

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::domain::{BrokerError, Job, JobError, Outcome, WorkerId};
use crate::ports::{Broker, Clock, SystemClock, WorkerHeartbeat};
use crate::typed::{JobContext, TypedRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Prefix of worker ids (`<name>-<pid>.u<unit>.s<slot>`).
    pub name: String,
    pub units: u32,
    pub slots: u32,
    /// Queues in priority order.
    pub queues: Vec<String>,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub poll_min: Duration,
    pub poll_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            name: config.name.clone(),
            units: config.units,
            slots: config.slots,
            queues: config.queues.clone(),
            lease_duration: config.lease_duration(),
            renew_interval: config.renew_interval(),
            poll_min: config.poll_min(),
            poll_max: config.poll_max(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

/// Handle to a running pool.
/// - `shutdown()` で新規 lease を止める
/// - `join()` で全 unit の終了（実行中ジョブの report 完了）を待つ
pub struct WorkerPool {
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `settings.units` worker units.
    ///
    /// Cancelling `shutdown` (or calling [`WorkerPool::shutdown`]) stops the
    /// pool.
    pub fn spawn(
        settings: WorkerSettings,
        broker: Arc<dyn Broker>,
        registry: Arc<TypedRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        let settings = Arc::new(settings);
        let joins = (0..settings.units)
            .map(|index| {
                let unit = WorkerUnit {
                    id: WorkerId::new(format!(
                        "{}-{}.u{index}",
                        settings.name,
                        std::process::id()
                    )),
                    settings: settings.clone(),
                    broker: broker.clone(),
                    registry: registry.clone(),
                };
                let shutdown = shutdown.clone();
                tokio::spawn(async move { unit.run_loop(shutdown).await })
            })
            .collect();

        tracing::info!(
            units = settings.units,
            slots = settings.slots,
            queues = ?settings.queues,
            "worker pool started"
        );
        Self { shutdown, joins }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every unit to stop.
    pub async fn join(self) {
        for join in self.joins {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "worker unit task failed");
            }
        }
    }

    pub async fn shutdown_and_join(self) {
        self.shutdown();
        self.join().await;
    }
}

/// One worker: `slots` concurrent execution lanes plus a heartbeat.
struct WorkerUnit {
    id: WorkerId,
    settings: Arc<WorkerSettings>,
    broker: Arc<dyn Broker>,
    registry: Arc<TypedRegistry>,
}

impl WorkerUnit {
    async fn run_loop(self, shutdown: CancellationToken) {
        let busy = Arc::new(AtomicU32::new(0));

        let slots: Vec<JoinHandle<()>> = (0..self.settings.slots)
            .map(|index| {
                let slot = Slot {
                    worker_id: WorkerId::new(format!("{}.s{index}", self.id)),
                    settings: self.settings.clone(),
                    broker: self.broker.clone(),
                    registry: self.registry.clone(),
                    busy: busy.clone(),
                };
                let shutdown = shutdown.clone();
                tokio::spawn(async move { slot.run(shutdown).await })
            })
            .collect();

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.id.clone(),
            self.settings.clone(),
            self.broker.clone(),
            busy,
            heartbeat_stop.clone(),
        ));

        for slot in slots {
            if let Err(err) = slot.await {
                tracing::error!(worker_id = %self.id, error = %err, "worker slot task failed");
            }
        }
        heartbeat_stop.cancel();
        let _ = heartbeat.await;
        if let Err(err) = self.broker.retire_worker(&self.id).await {
            tracing::warn!(worker_id = %self.id, error = %err, "failed to retire worker record");
        }
        tracing::info!(worker_id = %self.id, "worker unit stopped");
    }
}

async fn heartbeat_loop(
    worker_id: WorkerId,
    settings: Arc<WorkerSettings>,
    broker: Arc<dyn Broker>,
    busy: Arc<AtomicU32>,
    stop: CancellationToken,
) {
    let started_at = SystemClock.now();
    let mut ticker = tokio::time::interval(settings.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let heartbeat = WorkerHeartbeat {
            worker_id: worker_id.clone(),
            queues: settings.queues.clone(),
            slots: settings.slots,
            busy: busy.load(Ordering::Relaxed),
            started_at,
            last_seen: SystemClock.now(),
        };
        if let Err(err) = broker.heartbeat(heartbeat).await {
            tracing::warn!(worker_id = %worker_id, error = %err, "heartbeat failed");
        }
    }
}

struct Slot {
    worker_id: WorkerId,
    settings: Arc<WorkerSettings>,
    broker: Arc<dyn Broker>,
    registry: Arc<TypedRegistry>,
    busy: Arc<AtomicU32>,
}

impl Slot {
    async fn run(self, shutdown: CancellationToken) {
        let mut idle = self.settings.poll_min;

        while !shutdown.is_cancelled() {
            match self.lease_any().await {
                Ok(Some(job)) => {
                    idle = self.settings.poll_min;
                    self.busy.fetch_add(1, Ordering::Relaxed);
                    self.execute(job).await;
                    self.busy.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(worker_id = %self.worker_id, error = %err, "lease_next failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.broker.wait_for_work(idle) => {}
            }
            idle = (idle * 2).min(self.settings.poll_max);
        }
        tracing::debug!(worker_id = %self.worker_id, "worker slot stopped");
    }

    /// First leasable job over the configured queues, in priority order.
    async fn lease_any(&self) -> Result<Option<Job>, BrokerError> {
        for queue in &self.settings.queues {
            if let Some(job) = self
                .broker
                .lease_next(queue, &self.worker_id, self.settings.lease_duration)
                .await?
            {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn execute(&self, job: Job) {
        let job_id = job.id;
        let ctx = JobContext {
            job_id,
            queue: job.queue.clone(),
            kind: job.kind.clone(),
            attempt: job.current_attempt(),
            max_attempts: job.max_attempts,
            origin: job.origin,
        };
        tracing::info!(
            job_id = %job_id,
            queue = %job.queue,
            kind = %job.kind,
            attempt = ctx.attempt,
            worker_id = %self.worker_id,
            "job started"
        );

        let Some(handler) = self.registry.get(&job.kind) else {
            tracing::warn!(job_id = %job_id, kind = %job.kind, "no handler for kind");
            self.report(job_id, Outcome::RetryableFailure(JobError::unknown_kind(&job.kind)))
                .await;
            return;
        };

        let started = Instant::now();
        let payload = job.payload.clone();
        let abandon = CancellationToken::new();
        let mut task = {
            let abandon = abandon.clone();
            let runtime = Handle::current();
            tokio::task::spawn_blocking(move || {
                runtime.block_on(async move {
                    tokio::select! {
                        result = handler.handle_dyn(ctx, payload) => result,
                        _ = abandon.cancelled() => Err(JobError::cancelled("attempt abandoned")),
                    }
                })
            })
        };

        let deadline = tokio::time::sleep(job.timeout);
        tokio::pin!(deadline);
        let mut renew = tokio::time::interval_at(
            Instant::now() + self.settings.renew_interval,
            self.settings.renew_interval,
        );
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                joined = &mut task => break outcome_of(joined),
                _ = &mut deadline => {
                    abandon.cancel();
                    tracing::warn!(job_id = %job_id, timeout_ms = job.timeout.as_millis() as u64, "job timed out");
                    break Outcome::RetryableFailure(JobError::timeout(job.timeout));
                }
                _ = renew.tick() => {
                    match self.broker.renew_lease(job_id, &self.worker_id).await {
                        Ok(expires_at) => {
                            tracing::debug!(job_id = %job_id, %expires_at, "lease renewed");
                        }
                        Err(BrokerError::LeaseExpired { .. }) => {
                            abandon.cancel();
                            tracing::warn!(
                                job_id = %job_id,
                                worker_id = %self.worker_id,
                                "lease lost; attempt abandoned"
                            );
                            return;
                        }
                        Err(err) => {
                            tracing::warn!(job_id = %job_id, error = %err, "lease renewal failed");
                        }
                    }
                }
            }
        };

        tracing::info!(
            job_id = %job_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            success = outcome.is_success(),
            "job finished"
        );
        self.report(job_id, outcome).await;
    }

    async fn report(&self, job_id: crate::domain::JobId, outcome: Outcome) {
        match self.broker.report(job_id, &self.worker_id, outcome).await {
            Ok(state) => {
                tracing::debug!(job_id = %job_id, state = %state, "outcome reported");
            }
            Err(BrokerError::LeaseExpired { .. }) => {
                tracing::warn!(job_id = %job_id, "lease lost before report; outcome dropped");
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "failed to report outcome");
            }
        }
    }
}

fn outcome_of(joined: Result<Result<serde_json::Value, JobError>, JoinError>) -> Outcome {
    match joined {
        Ok(result) => Outcome::from(result),
        Err(err) if err.is_panic() => {
            let message = panic_message(err.into_panic());
            Outcome::RetryableFailure(JobError::panicked(format!("handler panicked: {message}")))
        }
        Err(err) => Outcome::RetryableFailure(JobError::cancelled(err.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
