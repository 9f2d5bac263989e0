//! Gateway - API 側からの唯一の書き込み口
//!
//! queue ごとの既定値（max_attempts / timeout / exclusive）を埋めてから
//! `Broker::enqueue` に渡す。ジョブの状態は `status` でポーリングする。

use std::sync::Arc;

use crate::config::{QueueConfig, QueueTable, ShuttleConfig};
use crate::domain::{BrokerError, Job, JobId, JobSpec, ValidationError};
use crate::ports::Broker;
use crate::typed::{CodecError, JobKind, PayloadCodec};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct Gateway {
    broker: Arc<dyn Broker>,
    queues: QueueTable,
}

impl Gateway {
    /// With an empty `queues`, any valid queue name is accepted.
    pub fn new(broker: Arc<dyn Broker>, queues: Vec<QueueConfig>) -> Self {
        Self {
            broker,
            queues: QueueTable::new(queues),
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &ShuttleConfig) -> Self {
        Self {
            broker,
            queues: config.queue_table(),
        }
    }

    /// Fill open fields from the queue's configuration.
    pub fn prepare(&self, spec: JobSpec) -> Result<JobSpec, ValidationError> {
        self.queues.prepare(spec)
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<JobId, BrokerError> {
        let spec = self.prepare(spec)?;
        let queue = spec.queue.clone();
        let kind = spec.kind.clone();
        let job_id = self.broker.enqueue(spec).await?;
        tracing::info!(job_id = %job_id, queue = %queue, kind = %kind, "job submitted");
        Ok(job_id)
    }

    pub async fn submit_typed<T: JobKind>(
        &self,
        queue: &str,
        job: &T,
    ) -> Result<JobId, GatewayError> {
        let payload = PayloadCodec::encode(job)?;
        Ok(self.submit(JobSpec::new(queue, T::KIND, payload)).await?)
    }

    pub async fn status(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        self.broker.get_job(job_id).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<(), BrokerError> {
        self.broker.cancel(job_id).await?;
        tracing::info!(job_id = %job_id, "job cancelled");
        Ok(())
    }

    pub async fn retry(&self, job_id: JobId) -> Result<(), BrokerError> {
        self.broker.retry_dead(job_id).await?;
        tracing::info!(job_id = %job_id, "job requeued by operator");
        Ok(())
    }
}
