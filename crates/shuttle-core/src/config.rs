//! Deployment configuration.
//!
//! Layering (later wins): built-in defaults, TOML file, `SHUTTLE_*`
//! environment variables, CLI flags (applied by the binary).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    JobDefaults, JobSpec, JobTemplate, RetryPolicy, Schedule, ScheduleId, Trigger,
    ValidationError,
};
use crate::impls::BrokerOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value '{value}' for {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub defaults: DefaultsConfig,
    pub queues: Vec<QueueConfig>,
    pub schedules: Vec<ScheduleDefinition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    Memory,
    #[default]
    Sqlite,
}

impl FromStr for BrokerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(BrokerBackend::Memory),
            "sqlite" => Ok(BrokerBackend::Sqlite),
            other => Err(format!("unknown broker backend '{other}' (memory|sqlite)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    /// Database file for the sqlite backend.
    pub path: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Sqlite,
            path: PathBuf::from("shuttle.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of worker ids.
    pub name: String,
    pub units: u32,
    pub slots: u32,
    /// Queues in priority order.
    pub queues: Vec<String>,
    pub lease_duration_ms: u64,
    pub renew_interval_ms: u64,
    pub poll_min_ms: u64,
    pub poll_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "shuttle".to_string(),
            units: 1,
            slots: 4,
            queues: vec!["default".to_string()],
            lease_duration_ms: 30_000,
            renew_interval_ms: 10_000,
            poll_min_ms: 100,
            poll_max_ms: 2_000,
            heartbeat_interval_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn poll_min(&self) -> Duration {
        Duration::from_millis(self.poll_min_ms)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub reap_interval_ms: u64,
    /// Worker records silent for longer than this are dropped by the reaper.
    pub worker_retention_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            reap_interval_ms: 5_000,
            worker_retention_ms: 3_600_000,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn worker_retention(&self) -> Duration {
        Duration::from_millis(self.worker_retention_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub max_attempts: u32,
    pub timeout_ms: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout_ms: 300_000,
        }
    }
}

impl DefaultsConfig {
    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            max_attempts: self.max_attempts,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Per-queue defaults applied by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub exclusive: bool,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: None,
            timeout_ms: None,
            exclusive: false,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Configured queues by name. Every job, submitted or scheduled, passes
/// through [`QueueTable::prepare`] before it reaches the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueTable {
    queues: HashMap<String, QueueConfig>,
}

impl QueueTable {
    /// With no queues, any valid queue name is accepted as is.
    pub fn new(queues: impl IntoIterator<Item = QueueConfig>) -> Self {
        Self {
            queues: queues.into_iter().map(|q| (q.name.clone(), q)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.is_empty() || self.queues.contains_key(name)
    }

    /// Fill open fields from the queue's configuration.
    pub fn prepare(&self, mut spec: JobSpec) -> Result<JobSpec, ValidationError> {
        if self.queues.is_empty() {
            return Ok(spec);
        }
        let queue = self
            .queues
            .get(&spec.queue)
            .ok_or_else(|| ValidationError::UnknownQueue(spec.queue.clone()))?;
        spec.max_attempts = spec.max_attempts.or(queue.max_attempts);
        spec.timeout = spec.timeout.or(queue.timeout());
        spec.exclusive |= queue.exclusive;
        Ok(spec)
    }
}

/// A schedule as written in configuration. Exactly one of `every_secs`,
/// `cron` and `at` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,

    #[serde(default)]
    pub every_secs: Option<u64>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,

    pub queue: String,
    pub kind: String,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn enabled() -> bool {
    true
}

impl ScheduleDefinition {
    pub fn trigger(&self) -> Result<Trigger, ValidationError> {
        let trigger = match (self.every_secs, &self.cron, self.at) {
            (Some(secs), None, None) => Trigger::every(Duration::from_secs(secs)),
            (None, Some(expr), None) => Trigger::cron(expr.clone()),
            (None, None, Some(at)) => Trigger::once(at),
            _ => {
                return Err(ValidationError::InvalidTrigger(format!(
                    "schedule '{}' must set exactly one of every_secs, cron, at",
                    self.name
                )));
            }
        };
        trigger.validate()?;
        Ok(trigger)
    }

    pub fn template(&self) -> JobTemplate {
        JobTemplate {
            queue: self.queue.clone(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            max_attempts: self.max_attempts,
            timeout: self.timeout_ms.map(Duration::from_millis),
            exclusive: self.exclusive,
        }
    }

    pub fn to_schedule(
        &self,
        id: ScheduleId,
        now: DateTime<Utc>,
    ) -> Result<Schedule, ValidationError> {
        let mut schedule = Schedule::new(id, &self.name, self.trigger()?, self.template(), now);
        schedule.enabled = self.enabled;
        schedule.validate()?;
        Ok(schedule)
    }
}

impl ShuttleConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// File (if given) + process environment, validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SHUTTLE_*` overrides from `vars`; other variables are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (var, value) in vars {
            match var.as_str() {
                "SHUTTLE_BROKER_BACKEND" => {
                    self.broker.backend = value
                        .parse()
                        .map_err(|reason| invalid_env(&var, &value, reason))?;
                }
                "SHUTTLE_BROKER_PATH" => self.broker.path = PathBuf::from(value),
                "SHUTTLE_WORKER_UNITS" => self.worker.units = parse_env(&var, &value)?,
                "SHUTTLE_WORKER_SLOTS" => self.worker.slots = parse_env(&var, &value)?,
                "SHUTTLE_WORKER_QUEUES" => {
                    self.worker.queues = value
                        .split(',')
                        .map(str::trim)
                        .filter(|q| !q.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "SHUTTLE_LEASE_DURATION_MS" => {
                    self.worker.lease_duration_ms = parse_env(&var, &value)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.worker;
        if w.units == 0 || w.slots == 0 {
            return Err(ConfigError::Invalid(
                "worker.units and worker.slots must be at least 1".to_string(),
            ));
        }
        if w.queues.is_empty() {
            return Err(ConfigError::Invalid("worker.queues is empty".to_string()));
        }
        if w.renew_interval_ms == 0 || w.renew_interval_ms >= w.lease_duration_ms {
            return Err(ConfigError::Invalid(format!(
                "worker.renew_interval_ms ({}) must be between 1 and lease_duration_ms ({})",
                w.renew_interval_ms, w.lease_duration_ms
            )));
        }
        if w.poll_min_ms == 0 || w.poll_min_ms > w.poll_max_ms {
            return Err(ConfigError::Invalid(format!(
                "worker.poll_min_ms ({}) must be between 1 and poll_max_ms ({})",
                w.poll_min_ms, w.poll_max_ms
            )));
        }
        if w.heartbeat_interval_ms == 0
            || self.scheduler.tick_interval_ms == 0
            || self.scheduler.reap_interval_ms == 0
            || self.scheduler.worker_retention_ms == 0
        {
            return Err(ConfigError::Invalid("intervals must be greater than zero".to_string()));
        }
        if self.defaults.max_attempts == 0 || self.defaults.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "defaults.max_attempts and defaults.timeout_ms must be at least 1".to_string(),
            ));
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier ({}) must be a finite number >= 1.0",
                self.retry.multiplier
            )));
        }

        let mut queue_names = HashSet::new();
        for queue in &self.queues {
            crate::domain::spec::validate_queue_name(&queue.name)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !queue_names.insert(queue.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate queue '{}'", queue.name)));
            }
            if queue.max_attempts == Some(0) || queue.timeout_ms == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "queue '{}': max_attempts and timeout_ms must be at least 1",
                    queue.name
                )));
            }
        }
        for queue in &w.queues {
            crate::domain::spec::validate_queue_name(queue)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        let queues = self.queue_table();
        let mut schedule_names = HashSet::new();
        for def in &self.schedules {
            if !queues.contains(&def.queue) {
                return Err(ConfigError::Invalid(format!(
                    "schedule '{}': queue '{}' is not configured",
                    def.name, def.queue
                )));
            }
            if !schedule_names.insert(def.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate schedule '{}'", def.name)));
            }
            def.trigger()
                .map_err(|e| ConfigError::Invalid(format!("schedule '{}': {e}", def.name)))?;
            def.template()
                .to_spec(Default::default())
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("schedule '{}': {e}", def.name)))?;
        }
        Ok(())
    }

    pub fn queue_table(&self) -> QueueTable {
        QueueTable::new(self.queues.clone())
    }

    /// Broker options with the configured defaults and backoff.
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions::default()
            .with_defaults(self.defaults.job_defaults())
            .with_retry(self.retry.policy())
    }
}

fn invalid_env(var: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_env<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    value.trim().parse().map_err(|e| invalid_env(var, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    const SAMPLE: &str = r#"
[broker]
backend = "sqlite"
path = "/var/lib/shuttle/jobs.db"

[worker]
units = 2
slots = 8
queues = ["critical", "default"]

[retry]
base_delay_ms = 500

[[queues]]
name = "critical"
max_attempts = 10
exclusive = true

[[queues]]
name = "default"

[[schedules]]
name = "nightly-gc"
cron = "0 3 * * *"
queue = "default"
kind = "gc"
payload = { dry_run = false }

[[schedules]]
name = "heartbeat"
every_secs = 60
queue = "default"
kind = "echo"
"#;

    #[test]
    fn parses_full_file_with_defaults_for_the_rest() {
        let config = ShuttleConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.broker.path, PathBuf::from("/var/lib/shuttle/jobs.db"));
        assert_eq!(config.worker.units, 2);
        assert_eq!(config.worker.lease_duration_ms, 30_000);
        assert_eq!(config.retry.policy().base_delay, Duration::from_millis(500));
        assert_eq!(config.retry.multiplier, 2.0);
        assert!(config.queues[0].exclusive);
        assert_eq!(config.schedules[0].payload, json!({"dry_run": false}));
        assert_eq!(config.schedules[1].payload, json!({}));
        config.validate().unwrap();
    }

    #[test]
    fn empty_file_is_the_default_config() {
        let config = ShuttleConfig::from_toml_str("").unwrap();
        assert_eq!(config, ShuttleConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut config = ShuttleConfig::from_toml_str(SAMPLE).unwrap();
        config
            .apply_env_overrides([
                ("SHUTTLE_WORKER_SLOTS".to_string(), "3".to_string()),
                ("SHUTTLE_WORKER_QUEUES".to_string(), "a, b".to_string()),
                ("SHUTTLE_BROKER_PATH".to_string(), "other.db".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ])
            .unwrap();
        assert_eq!(config.worker.slots, 3);
        assert_eq!(config.worker.queues, vec!["a", "b"]);
        assert_eq!(config.broker.path, PathBuf::from("other.db"));
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = ShuttleConfig::default();
        let err = config
            .apply_env_overrides([("SHUTTLE_WORKER_UNITS".to_string(), "many".to_string())])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var, .. } if var == "SHUTTLE_WORKER_UNITS"));
    }

    #[rstest]
    #[case("[worker]\nslots = 0")]
    #[case("[worker]\nrenew_interval_ms = 30000")]
    #[case("[worker]\npoll_min_ms = 5000")]
    #[case("[[queues]]\nname = \"a\"\n[[queues]]\nname = \"a\"")]
    #[case("[[schedules]]\nname = \"s\"\nqueue = \"q\"\nkind = \"k\"")]
    #[case("[[queues]]\nname = \"a\"\n[[schedules]]\nname = \"s\"\nevery_secs = 1\nqueue = \"b\"\nkind = \"k\"")]
    #[case("[[schedules]]\nname = \"s\"\ncron = \"bad\"\nqueue = \"q\"\nkind = \"k\"")]
    #[case("[[schedules]]\nname = \"s\"\nevery_secs = 1\ncron = \"* * * * *\"\nqueue = \"q\"\nkind = \"k\"")]
    fn invalid_configs_are_rejected(#[case] content: &str) {
        let config = ShuttleConfig::from_toml_str(content).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn queue_table_fills_open_fields() {
        let config = ShuttleConfig::from_toml_str(SAMPLE).unwrap();
        let table = config.queue_table();

        let spec = table
            .prepare(JobSpec::new("critical", "echo", json!({})))
            .unwrap();
        assert_eq!(spec.max_attempts, Some(10));
        assert!(spec.exclusive);
        assert_eq!(spec.timeout, None);

        let err = table
            .prepare(JobSpec::new("bulk", "echo", json!({})))
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownQueue("bulk".to_string()));

        assert!(QueueTable::default().contains("anything"));
    }

    #[test]
    fn definition_builds_schedule() {
        let config = ShuttleConfig::from_toml_str(SAMPLE).unwrap();
        let now = Utc::now();
        let schedule = config.schedules[1]
            .to_schedule(ScheduleId::from_ulid(ulid::Ulid::new()), now)
            .unwrap();
        assert_eq!(schedule.trigger, Trigger::every(Duration::from_secs(60)));
        assert!(schedule.next_fire_at.is_some_and(|at| at > now));
    }
}
