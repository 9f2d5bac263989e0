//! A scheduler that was down catches up with one firing, not a burst.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use shuttle_core::app::Scheduler;
use shuttle_core::config::ScheduleDefinition;
use shuttle_core::domain::{JobOrigin, JobState};
use shuttle_core::impls::{BrokerHandle, BrokerOptions, SqliteBroker};
use shuttle_core::ports::{Broker, Clock, FixedClock, JobFilter, ScheduleStore, StatusView, UlidGenerator};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn definition() -> ScheduleDefinition {
    ScheduleDefinition {
        name: "heartbeat".to_string(),
        every_secs: Some(1),
        cron: None,
        at: None,
        queue: "default".to_string(),
        kind: "demo.echo.v1".to_string(),
        payload: serde_json::json!({ "ping": true }),
        max_attempts: None,
        timeout_ms: None,
        exclusive: false,
        enabled: true,
    }
}

fn start(path: &std::path::Path, clock: &FixedClock) -> (BrokerHandle, Scheduler) {
    let clock_dyn: Arc<dyn Clock> = Arc::new(clock.clone());
    let broker = SqliteBroker::open(path, BrokerOptions::default().with_clock(clock_dyn.clone())).unwrap();
    let handle = BrokerHandle::new(Arc::new(broker));
    let scheduler = Scheduler::new(
        handle.schedules.clone(),
        clock_dyn.clone(),
        Arc::new(UlidGenerator::new(clock_dyn)),
        Duration::from_secs(1),
    );
    (handle, scheduler)
}

#[tokio::test]
async fn restart_fires_missed_schedule_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shuttle.db");
    let clock = FixedClock::new(t0());

    {
        let (handle, scheduler) = start(&path, &clock);
        let registered = scheduler.register(&[definition()]).await.unwrap();
        assert_eq!(registered[0].next_fire_at, Some(t0() + TimeDelta::seconds(1)));
        assert!(handle.status.list_jobs(JobFilter::default()).await.unwrap().is_empty());
    }

    // Down from T+0 to T+5.
    clock.set(t0() + TimeDelta::seconds(5));
    let (handle, scheduler) = start(&path, &clock);
    let registered = scheduler.register(&[definition()]).await.unwrap();
    assert_eq!(registered[0].next_fire_at, Some(t0() + TimeDelta::seconds(1)));

    let report = scheduler.tick(clock.now()).await;
    assert_eq!(report.fired.len(), 1);
    assert_eq!(report.fired[0].fire_at, t0() + TimeDelta::seconds(1));

    let again = scheduler.tick(clock.now()).await;
    assert!(again.fired.is_empty());

    let jobs = handle.status.list_jobs(JobFilter::default()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Queued);
    assert!(matches!(jobs[0].origin, JobOrigin::Schedule { .. }));

    let schedule = handle.schedules.list_schedules().await.unwrap().remove(0);
    assert_eq!(schedule.next_fire_at, Some(t0() + TimeDelta::seconds(6)));
    assert_eq!(schedule.last_fired_at, Some(t0() + TimeDelta::seconds(1)));

    clock.set(t0() + TimeDelta::seconds(6));
    let report = scheduler.tick(clock.now()).await;
    assert_eq!(report.fired.len(), 1);
    let job = handle.broker.get_job(report.fired[0].job_id).await.unwrap().unwrap();
    assert_eq!(
        job.origin,
        JobOrigin::Schedule {
            schedule_id: schedule.id,
            fire_at: t0() + TimeDelta::seconds(6)
        }
    );
}

#[tokio::test]
async fn two_schedulers_share_one_firing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shuttle.db");
    let clock = FixedClock::new(t0());

    let (handle, first) = start(&path, &clock);
    let (_other, second) = start(&path, &clock);
    first.register(&[definition()]).await.unwrap();
    second.register(&[definition()]).await.unwrap();

    let at = t0() + TimeDelta::seconds(1);
    let a = first.tick(at).await;
    let b = second.tick(at).await;
    assert_eq!(a.fired.len() + b.fired.len(), 1);
    assert_eq!(handle.status.list_jobs(JobFilter::default()).await.unwrap().len(), 1);
}
