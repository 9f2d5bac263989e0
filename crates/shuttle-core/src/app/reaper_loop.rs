//! ReaperLoop - Lease 期限切れの回収
//!
//! worker が落ちて report されないまま lease が切れたジョブを、
//! retryable failure（`worker lease expired`）として扱い再配送する。
//! ついでに、retention を過ぎても heartbeat が来ない worker の記録を消す
//! （クラッシュした process の分が残り続けないように）。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::{BrokerError, JobId};
use crate::ports::Broker;

pub struct ReaperLoop {
    broker: Arc<dyn Broker>,
    interval: Duration,
    worker_retention: Duration,
}

impl ReaperLoop {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration) -> Self {
        Self {
            broker,
            interval,
            worker_retention: Duration::from_secs(3_600),
        }
    }

    pub fn with_worker_retention(mut self, retention: Duration) -> Self {
        self.worker_retention = retention;
        self
    }

    pub async fn reap_once(&self) -> Result<Vec<JobId>, BrokerError> {
        let reaped = self.broker.reap_expired_leases().await?;
        for job_id in &reaped {
            tracing::warn!(job_id = %job_id, "expired lease reclaimed");
        }

        match self.broker.prune_workers(self.worker_retention).await {
            Ok(pruned) => {
                for worker_id in &pruned {
                    tracing::info!(worker_id = %worker_id, "silent worker forgotten");
                }
            }
            Err(err) => tracing::warn!(error = %err, "pruning worker records failed"),
        }
        Ok(reaped)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.reap_once().await {
                        tracing::error!(error = %err, "reaping expired leases failed");
                    }
                }
            }
        }
        tracing::debug!("reaper stopped");
    }
}
