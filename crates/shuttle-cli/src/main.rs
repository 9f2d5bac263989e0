mod args;
mod handlers;
mod logging;
mod shutdown;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use shuttle_core::app::{Gateway, ReaperLoop, Scheduler, StatusReport, WorkerPool, WorkerSettings};
use shuttle_core::config::ShuttleConfig;
use shuttle_core::domain::{JobSpec, time};
use shuttle_core::impls::BrokerHandle;
use shuttle_core::ports::{
    Clock, JobFilter, ScheduleStore, StatusView, SystemClock, UlidGenerator,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::args::{Args, Command, JobCommand, OutputFormat, ScheduleCommand};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_format);

    match begin(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = format!("{error:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn begin(args: Args) -> Result<()> {
    let config = ShuttleConfig::load(args.config.as_deref()).context("loading configuration")?;
    let handle = BrokerHandle::open(&config.broker, config.broker_options())
        .context("opening broker")?;

    match args.command {
        Command::Worker { queues } => {
            let shutdown = shutdown::install();
            let pool = spawn_pool(&config, &handle, queues, shutdown)?;
            pool.join().await;
        }
        Command::Scheduler => {
            let shutdown = shutdown::install();
            let scheduler = scheduler(&config, &handle).await?;
            let reaper = reaper(&config, &handle);
            tokio::join!(scheduler.run(shutdown.clone()), reaper.run(shutdown));
        }
        Command::Run => {
            let shutdown = shutdown::install();
            let scheduler = scheduler(&config, &handle).await?;
            let reaper = reaper(&config, &handle);
            let pool = spawn_pool(&config, &handle, Vec::new(), shutdown.clone())?;
            tokio::join!(
                pool.join(),
                scheduler.run(shutdown.clone()),
                reaper.run(shutdown)
            );
        }
        Command::Enqueue {
            queue,
            kind,
            payload,
            delay_ms,
            max_attempts,
            timeout_ms,
            exclusive,
        } => {
            let payload = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut spec = JobSpec::new(queue, kind, payload).exclusive(exclusive);
            if let Some(ms) = delay_ms {
                spec = spec.scheduled_for(time::add(SystemClock.now(), Duration::from_millis(ms)));
            }
            if let Some(max_attempts) = max_attempts {
                spec = spec.with_max_attempts(max_attempts);
            }
            if let Some(ms) = timeout_ms {
                spec = spec.with_timeout(Duration::from_millis(ms));
            }
            let job_id = Gateway::from_config(handle.broker.clone(), &config)
                .submit(spec)
                .await?;
            println!("{job_id}");
        }
        Command::Job(command) => job_command(&config, &handle, command).await?,
        Command::Schedule(ScheduleCommand::List) => {
            for schedule in handle.schedules.list_schedules().await? {
                println!("{}", serde_json::to_string(&schedule)?);
            }
        }
        Command::Schedule(ScheduleCommand::Remove { id }) => {
            handle.schedules.remove_schedule(id).await?;
            info!(schedule_id = %id, "schedule removed");
        }
        Command::Status { output } => {
            let report = StatusReport::collect(
                handle.status.as_ref(),
                SystemClock.now(),
                config.worker.heartbeat_interval(),
            )
            .await?;
            match output {
                OutputFormat::Table => print!("{report}"),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
    }
    Ok(())
}

async fn job_command(config: &ShuttleConfig, handle: &BrokerHandle, command: JobCommand) -> Result<()> {
    let gateway = Gateway::from_config(handle.broker.clone(), config);
    match command {
        JobCommand::Status { id } => {
            let job = gateway
                .status(id)
                .await?
                .ok_or_else(|| anyhow!("job {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobCommand::Cancel { id } => gateway.cancel(id).await?,
        JobCommand::Retry { id } => gateway.retry(id).await?,
        JobCommand::List { queue, state, limit } => {
            let jobs = handle
                .status
                .list_jobs(JobFilter { queue, state, limit })
                .await?;
            for job in jobs {
                println!(
                    "{}\t{}\t{}\t{}\t{}/{}",
                    job.id, job.queue, job.kind, job.state, job.attempt_count, job.max_attempts
                );
            }
        }
    }
    Ok(())
}

fn spawn_pool(
    config: &ShuttleConfig,
    handle: &BrokerHandle,
    queues: Vec<String>,
    shutdown: CancellationToken,
) -> Result<WorkerPool> {
    let app = handlers::app()?;
    let mut settings = WorkerSettings::from(&config.worker);
    if !queues.is_empty() {
        settings.queues = queues;
    }
    info!(kinds = ?app.registry.registered_kinds(), "handlers registered");
    Ok(WorkerPool::spawn(
        settings,
        handle.broker.clone(),
        app.registry,
        shutdown,
    ))
}

fn reaper(config: &ShuttleConfig, handle: &BrokerHandle) -> ReaperLoop {
    ReaperLoop::new(handle.broker.clone(), config.scheduler.reap_interval())
        .with_worker_retention(config.scheduler.worker_retention())
}

async fn scheduler(config: &ShuttleConfig, handle: &BrokerHandle) -> Result<Scheduler> {
    let scheduler = Scheduler::new(
        handle.schedules.clone(),
        Arc::new(SystemClock),
        Arc::new(UlidGenerator::new(SystemClock)),
        config.scheduler.tick_interval(),
    )
    .with_queues(config.queue_table());
    scheduler
        .register(&config.schedules)
        .await
        .context("registering schedules")?;
    Ok(scheduler)
}
