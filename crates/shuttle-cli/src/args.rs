use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use shuttle_core::domain::{JobId, JobState, ScheduleId};

#[derive(Parser, Debug)]
#[command(name = "shuttle", about, long_about = None, version)]
pub(crate) struct Args {
    /// TOML configuration file. `SHUTTLE_*` variables override it.
    #[arg(short, long, env = "SHUTTLE_CONFIG", global = true)]
    pub(crate) config: Option<PathBuf>,
    /// Log output format. Filtering follows `RUST_LOG`.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub(crate) log_format: LogFormat,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run a worker pool until interrupted.
    Worker {
        /// Queues to consume, highest priority first. Overrides configuration.
        #[arg(short, long, value_delimiter = ',')]
        queues: Vec<String>,
    },
    /// Run the scheduler and the lease reaper until interrupted.
    Scheduler,
    /// Run worker pool, scheduler and reaper in one process.
    Run,
    /// Submit a job.
    Enqueue {
        queue: String,
        kind: String,
        /// JSON payload.
        #[arg(default_value = "{}")]
        payload: String,
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        exclusive: bool,
    },
    /// Inspect or manage a job.
    #[command(subcommand)]
    Job(JobCommand),
    /// Inspect schedules.
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Queue depths, workers and active leases.
    Status {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum JobCommand {
    Status { id: JobId },
    Cancel { id: JobId },
    /// Requeue a dead or failed job with a fresh attempt budget.
    Retry { id: JobId },
    List {
        #[arg(short, long)]
        queue: Option<String>,
        #[arg(short, long)]
        state: Option<JobState>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum ScheduleCommand {
    List,
    /// Delete a stored schedule. Schedules still present in the config file
    /// come back on the next scheduler start.
    Remove { id: ScheduleId },
}
