//! Scheduler integration tests: manual triggers, arming and run locks.

mod test_utils;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sheetsync::config::SchedulerConfig;
use sheetsync::models::{JobStatus, RunStatus, SyncMode};
use sheetsync::repositories::JobStore;
use sheetsync::scheduler::{DISABLED, JobScheduler, NOT_FOUND, SchedulerError};
use sheetsync::sync_executor::ALREADY_RUNNING;

use test_utils::{Harness, SHEET, harness, order_rows, orders_job};

fn scheduler(h: &Harness) -> Arc<JobScheduler> {
    Arc::new(JobScheduler::new(
        h.store.clone() as Arc<dyn JobStore>,
        Arc::clone(&h.executor),
        &SchedulerConfig::default(),
    ))
}

#[tokio::test]
async fn trigger_while_running_is_rejected_without_new_log() -> Result<()> {
    let h = harness(order_rows(&[1, 2, 3], "2025-01-01T00:00:00Z")).await?;
    h.sheet.set_write_delay(Duration::from_millis(300));
    let job = orders_job(SyncMode::Full);
    h.store.save_job(&job).await?;

    let scheduler = scheduler(&h);
    scheduler.initialize().await?;

    let first = scheduler.trigger(job.id).await?;
    assert!(first.accepted);
    assert_eq!(first.reason, None);

    let status = scheduler.get_scheduler_status();
    assert!(status[&job.id].running);
    assert_eq!(status[&job.id].last_status, JobStatus::Running);

    let second = scheduler.trigger(job.id).await?;
    assert!(!second.accepted);
    assert_eq!(second.reason.as_deref(), Some(ALREADY_RUNNING));

    scheduler.wait_idle().await;

    let logs = h.store.list_execution_logs(job.id, 10).await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Success);
    assert_eq!(h.sheet.rows(SHEET).len(), 3);
    assert!(!scheduler.locks().is_held(job.id));
    Ok(())
}

#[tokio::test]
async fn finished_run_updates_runtime_status_and_job_record() -> Result<()> {
    let h = harness(order_rows(&[1, 2], "2025-01-01T00:00:00Z")).await?;
    let job = orders_job(SyncMode::Full);
    h.store.save_job(&job).await?;

    let scheduler = scheduler(&h);
    scheduler.initialize().await?;
    assert!(scheduler.trigger(job.id).await?.accepted);
    scheduler.wait_idle().await;

    let status = scheduler.get_scheduler_status();
    let runtime = &status[&job.id];
    assert!(!runtime.running);
    assert_eq!(runtime.last_status, JobStatus::Success);
    assert!(runtime.last_run.is_some());

    let stored = h.store.load_job(job.id).await?.expect("job exists");
    assert_eq!(stored.status, JobStatus::Success);
    assert_eq!(stored.retry_count, 0);
    assert!(stored.next_run.is_some_and(|at| at > Utc::now()));
    Ok(())
}

#[tokio::test]
async fn trigger_reports_unknown_and_disabled_jobs() -> Result<()> {
    let h = harness(Vec::new()).await?;
    let mut disabled = orders_job(SyncMode::Full);
    disabled.enabled = false;
    h.store.save_job(&disabled).await?;

    let scheduler = scheduler(&h);
    scheduler.initialize().await?;

    let missing = scheduler.trigger(Uuid::new_v4()).await?;
    assert!(!missing.accepted);
    assert_eq!(missing.reason.as_deref(), Some(NOT_FOUND));

    let result = scheduler.trigger(disabled.id).await?;
    assert!(!result.accepted);
    assert_eq!(result.reason.as_deref(), Some(DISABLED));
    assert!(h.store.list_execution_logs(disabled.id, 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn initialize_arms_enabled_jobs_once() -> Result<()> {
    let h = harness(Vec::new()).await?;
    let enabled = orders_job(SyncMode::Full);
    let mut disabled = orders_job(SyncMode::Full);
    disabled.enabled = false;
    h.store.save_job(&enabled).await?;
    h.store.save_job(&disabled).await?;

    let scheduler = scheduler(&h);
    assert_eq!(scheduler.initialize().await?, 1);

    let armed_at = scheduler.get_scheduler_status()[&enabled.id].next_run;
    assert!(armed_at.is_some());

    // A second call keeps the existing arming.
    assert_eq!(scheduler.initialize().await?, 1);
    assert_eq!(scheduler.get_scheduler_status()[&enabled.id].next_run, armed_at);
    assert!(!scheduler.get_scheduler_status().contains_key(&disabled.id));

    let stored = h.store.load_job(enabled.id).await?.expect("job exists");
    assert_eq!(stored.next_run, armed_at);
    Ok(())
}

#[tokio::test]
async fn reload_picks_up_new_and_disabled_jobs() -> Result<()> {
    let h = harness(Vec::new()).await?;
    let mut first = orders_job(SyncMode::Full);
    h.store.save_job(&first).await?;

    let scheduler = scheduler(&h);
    assert_eq!(scheduler.initialize().await?, 1);

    let second = orders_job(SyncMode::Full);
    h.store.save_job(&second).await?;
    first.enabled = false;
    h.store.save_job(&first).await?;

    assert_eq!(scheduler.reload().await?, 1);
    let status = scheduler.get_scheduler_status();
    assert!(status.contains_key(&second.id));
    assert!(!status.contains_key(&first.id));
    Ok(())
}

#[tokio::test]
async fn running_job_cannot_be_deleted() -> Result<()> {
    let h = harness(order_rows(&[1], "2025-01-01T00:00:00Z")).await?;
    h.sheet.set_write_delay(Duration::from_millis(300));
    let job = orders_job(SyncMode::Full);
    h.store.save_job(&job).await?;

    let scheduler = scheduler(&h);
    scheduler.initialize().await?;
    assert!(scheduler.trigger(job.id).await?.accepted);

    let err = scheduler.delete_job(job.id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobRunning { job_id } if job_id == job.id));

    scheduler.wait_idle().await;
    assert!(scheduler.delete_job(job.id).await?);
    assert!(h.store.load_job(job.id).await?.is_none());
    assert!(!scheduler.get_scheduler_status().contains_key(&job.id));
    Ok(())
}

#[tokio::test]
async fn scheduling_loop_stops_on_shutdown() -> Result<()> {
    let h = harness(Vec::new()).await?;
    h.store.save_job(&orders_job(SyncMode::Full)).await?;

    let scheduler = Arc::new(
        JobScheduler::new(
            h.store.clone() as Arc<dyn JobStore>,
            Arc::clone(&h.executor),
            &SchedulerConfig::default(),
        )
        .with_tick_interval(Duration::from_millis(10)),
    );
    scheduler.initialize().await?;
    scheduler.start(CancellationToken::new());

    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::timeout(Duration::from_secs(2), scheduler.shutdown()).await?;
    Ok(())
}

#[tokio::test]
async fn reload_during_run_rearms_with_new_schedule() -> Result<()> {
    let h = harness(order_rows(&[1, 2], "2025-01-01T00:00:00Z")).await?;
    h.sheet.set_write_delay(Duration::from_millis(300));
    let mut job = orders_job(SyncMode::Full);
    h.store.save_job(&job).await?;

    let scheduler = scheduler(&h);
    scheduler.initialize().await?;
    assert!(scheduler.trigger(job.id).await?.accepted);

    job.schedule = "17 * * * *".to_string();
    h.store.save_job(&job).await?;
    assert_eq!(scheduler.reload().await?, 1);

    let status = scheduler.get_scheduler_status();
    assert!(status[&job.id].running);
    let rearmed = status[&job.id].next_run.expect("job re-armed");
    assert_eq!(rearmed.minute(), 17);

    scheduler.wait_idle().await;

    // The in-flight run finished with the definition it started with.
    let logs = h.store.list_execution_logs(job.id, 10).await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Success);

    let status = scheduler.get_scheduler_status();
    assert!(!status[&job.id].running);
    assert_eq!(status[&job.id].next_run, Some(rearmed));
    let stored = h.store.load_job(job.id).await?.expect("job exists");
    assert_eq!(stored.next_run, Some(rearmed));
    Ok(())
}
