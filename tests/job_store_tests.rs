//! Job store persistence tests against migrated in-memory SQLite.

mod test_utils;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use sheetsync::cursor::Cursor;
use sheetsync::error::{ConfigurationError, StoreError};
use sheetsync::models::{
    ExecutionLog, FieldMapping, JobStatus, RunStatus, SyncMode, ValidationError,
};
use sheetsync::repositories::{JobRunState, JobStore};

use test_utils::{orders_job, setup_store};

#[tokio::test]
async fn saved_job_round_trips() -> Result<()> {
    let store = setup_store().await?;
    let job = orders_job(SyncMode::Incremental);
    store.save_job(&job).await?;

    let loaded = store.load_job(job.id).await?.expect("job saved");
    assert_eq!(loaded, job);
    assert_eq!(store.load_jobs(false).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn invalid_job_is_rejected_at_save() -> Result<()> {
    let store = setup_store().await?;
    let mut job = orders_job(SyncMode::Full);
    job.mapping
        .fields
        .push(FieldMapping::new("state", "status"));

    let err = store.save_job(&job).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Configuration(ConfigurationError::DuplicateTargetField { ref field }) if field == "status"
    ));
    assert!(store.load_job(job.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn save_replaces_existing_definition() -> Result<()> {
    let store = setup_store().await?;
    let mut job = orders_job(SyncMode::Full);
    store.save_job(&job).await?;

    job.schedule = "0 2 * * *".to_string();
    job.enabled = false;
    store.save_job(&job).await?;

    let loaded = store.load_job(job.id).await?.expect("job saved");
    assert_eq!(loaded.schedule, "0 2 * * *");
    assert!(store.load_jobs(true).await?.is_empty());
    assert_eq!(store.load_jobs(false).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn run_state_is_written_back() -> Result<()> {
    let store = setup_store().await?;
    let job = orders_job(SyncMode::Full);
    store.save_job(&job).await?;

    let last_run = Utc::now();
    let state = JobRunState {
        status: JobStatus::Failed,
        last_run: Some(last_run),
        next_run: Some(last_run + Duration::minutes(5)),
        last_error: Some("sheet offline".to_string()),
        retry_count: 2,
    };
    store.record_run_state(job.id, &state).await?;

    let loaded = store.load_job(job.id).await?.expect("job saved");
    assert_eq!(loaded.status, JobStatus::Failed);
    assert_eq!(loaded.retry_count, 2);
    assert_eq!(loaded.last_error.as_deref(), Some("sheet offline"));
    assert!(loaded.next_run.is_some());

    let err = store
        .record_run_state(Uuid::new_v4(), &state)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { entity: "job", .. }));
    Ok(())
}

#[tokio::test]
async fn cursor_saves_overwrite_and_clear() -> Result<()> {
    let store = setup_store().await?;
    let job = orders_job(SyncMode::Incremental);
    store.save_job(&job).await?;
    assert!(store.load_cursor(job.id).await?.is_none());

    let first = Cursor::incremental(json!("2025-01-01T00:00:00Z"), Some(json!(3)));
    store.save_cursor(job.id, &first).await?;
    assert_eq!(store.load_cursor(job.id).await?, Some(first));

    let second = Cursor::Page {
        page: 2,
        total_pages: None,
        last_key: Some(json!(40)),
        exhausted: false,
    };
    store.save_cursor(job.id, &second).await?;
    assert_eq!(store.load_cursor(job.id).await?, Some(second));

    store.clear_cursor(job.id).await?;
    assert!(store.load_cursor(job.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn finalized_log_cannot_be_written_again() -> Result<()> {
    let store = setup_store().await?;
    let job = orders_job(SyncMode::Full);
    store.save_job(&job).await?;

    let mut log = ExecutionLog::start(job.id);
    store.append_execution_log(&log).await?;

    log.records_processed = 4;
    log.records_succeeded = 3;
    log.records_failed = 1;
    log.validation_errors
        .push(ValidationError::error("amount", json!("x"), "not a number").with_row_key(Some(json!(7))));
    store.update_execution_log(&log).await?;

    log.finish(RunStatus::Success, None);
    store.finalize_execution_log(&log).await?;

    let err = store.finalize_execution_log(&log).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyFinalized { log_id } if log_id == log.id));
    let err = store.update_execution_log(&log).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyFinalized { .. }));

    let logs = store.list_execution_logs(job.id, 10).await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RunStatus::Success);
    assert_eq!(logs[0].records_failed, 1);
    assert_eq!(logs[0].validation_errors, log.validation_errors);
    assert!(logs[0].end_time.is_some());
    Ok(())
}

#[tokio::test]
async fn updating_unknown_log_is_not_found() -> Result<()> {
    let store = setup_store().await?;
    let log = ExecutionLog::start(Uuid::new_v4());
    let err = store.update_execution_log(&log).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { entity: "execution log", .. }));
    Ok(())
}

#[tokio::test]
async fn logs_are_listed_newest_first() -> Result<()> {
    let store = setup_store().await?;
    let job = orders_job(SyncMode::Full);
    store.save_job(&job).await?;

    let base = Utc::now() - Duration::hours(1);
    let mut ids = Vec::new();
    for minutes in [0, 20, 10] {
        let mut log = ExecutionLog::start(job.id);
        log.start_time = base + Duration::minutes(minutes);
        store.append_execution_log(&log).await?;
        ids.push(log.id);
    }

    let logs = store.list_execution_logs(job.id, 10).await?;
    let listed: Vec<Uuid> = logs.iter().map(|log| log.id).collect();
    assert_eq!(listed, vec![ids[1], ids[2], ids[0]]);

    let limited = store.list_execution_logs(job.id, 2).await?;
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].id, ids[1]);
    Ok(())
}

#[tokio::test]
async fn delete_removes_job_cursor_and_history() -> Result<()> {
    let store = setup_store().await?;
    let job = orders_job(SyncMode::Incremental);
    store.save_job(&job).await?;
    store
        .save_cursor(job.id, &Cursor::incremental(json!("2025-01-01T00:00:00Z"), None))
        .await?;
    store.append_execution_log(&ExecutionLog::start(job.id)).await?;

    assert!(store.delete_job(job.id).await?);
    assert!(store.load_job(job.id).await?.is_none());
    assert!(store.load_cursor(job.id).await?.is_none());
    assert!(store.list_execution_logs(job.id, 10).await?.is_empty());

    assert!(!store.delete_job(job.id).await?);
    Ok(())
}
