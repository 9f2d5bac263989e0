//! Impls - ports の実装
//!
//! - **MemoryBroker**: in-process（開発・テスト用、永続化なし）
//! - **SqliteBroker**: SQLite ファイル（本番用、複数プロセスで共有可能）

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use crate::config::{BrokerBackend, BrokerConfig};
use crate::domain::{BrokerError, Decider, DefaultDecider, JobDefaults, RetryPolicy};
use crate::ports::{Broker, Clock, ScheduleStore, StatusView, SystemClock};

pub use self::memory::MemoryBroker;
pub use self::sqlite::SqliteBroker;

/// Settings shared by every broker backend.
#[derive(Clone)]
pub struct BrokerOptions {
    pub defaults: JobDefaults,
    pub clock: Arc<dyn Clock>,
    pub decider: Arc<dyn Decider>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            defaults: JobDefaults::default(),
            clock: Arc::new(SystemClock),
            decider: Arc::new(DefaultDecider::default()),
        }
    }
}

impl BrokerOptions {
    pub fn with_defaults(mut self, defaults: JobDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use the default decider with this backoff policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.decider = Arc::new(DefaultDecider::new(retry));
        self
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }
}

/// One backend seen through each of its ports.
#[derive(Clone)]
pub struct BrokerHandle {
    pub broker: Arc<dyn Broker>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub status: Arc<dyn StatusView>,
}

impl BrokerHandle {
    pub fn new<B>(backend: Arc<B>) -> Self
    where
        B: Broker + ScheduleStore + StatusView + 'static,
    {
        Self {
            broker: backend.clone(),
            schedules: backend.clone(),
            status: backend,
        }
    }

    /// Open the backend selected by configuration.
    pub fn open(config: &BrokerConfig, options: BrokerOptions) -> Result<Self, BrokerError> {
        match config.backend {
            BrokerBackend::Memory => Ok(Self::new(Arc::new(MemoryBroker::new(options)))),
            BrokerBackend::Sqlite => {
                let broker = SqliteBroker::open(&config.path, options)?;
                tracing::info!(path = %config.path.display(), "sqlite broker opened");
                Ok(Self::new(Arc::new(broker)))
            }
        }
    }
}
