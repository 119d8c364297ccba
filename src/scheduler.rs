//! # Job Scheduler
//!
//! Owns the armed cron schedule of every enabled job and the per-job run
//! locks. A single loop sleeps until the earliest due job (bounded by the tick
//! interval), fires due jobs as independent tasks and re-arms them from their
//! cron expression. Manual triggers share the same locks, so at most one run
//! of a job is ever in flight.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, FixedOffset, Utc};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::cron::{CronSchedule, offset_from_minutes};
use crate::error::{ApiError, StoreError, conflict};
use crate::models::{JobStatus, RunStatus, SyncJob};
use crate::repositories::JobStore;
use crate::run_lock::{RunLockGuard, RunLocks};
use crate::sync_executor::{ALREADY_RUNNING, SyncExecutor};

/// Reason reported for a trigger on an unknown job.
pub const NOT_FOUND: &str = "not found";
/// Reason reported for a trigger on a disabled job.
pub const DISABLED: &str = "disabled";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job {job_id} is running")]
    JobRunning { job_id: Uuid },
}

impl From<SchedulerError> for ApiError {
    fn from(error: SchedulerError) -> Self {
        match error {
            SchedulerError::Store(store) => store.into(),
            SchedulerError::JobRunning { job_id } => {
                conflict(&format!("job {job_id} is running"))
            }
        }
    }
}

/// Answer to a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TriggerResult {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TriggerResult {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn rejected(reason: &str) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Runtime view of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobRuntimeStatus {
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: JobStatus,
}

#[derive(Debug, Clone)]
struct ArmedJob {
    job: SyncJob,
    schedule: CronSchedule,
    next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    initialized: bool,
    armed: HashMap<Uuid, ArmedJob>,
}

/// Cron-driven scheduler and manual trigger entry point.
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    executor: Arc<SyncExecutor>,
    locks: RunLocks,
    tick_interval: Duration,
    utc_offset: FixedOffset,
    state: Arc<Mutex<SchedulerState>>,
    runs: TaskTracker,
    disarm: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

fn lock_state(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How long the loop may sleep before the earliest armed job is due.
fn sleep_budget(
    next_due: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    tick_interval: Duration,
) -> Duration {
    match next_due {
        Some(due) => (due - now).to_std().unwrap_or(Duration::ZERO).min(tick_interval),
        None => tick_interval,
    }
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<SyncExecutor>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            locks: RunLocks::new(),
            tick_interval: Duration::from_secs(config.tick_interval_seconds.max(1)),
            utc_offset: offset_from_minutes(config.utc_offset_minutes),
            state: Arc::new(Mutex::new(SchedulerState::default())),
            runs: TaskTracker::new(),
            disarm: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Override the loop's maximum sleep (primarily for tests).
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn locks(&self) -> &RunLocks {
        &self.locks
    }

    /// Arm every enabled job. Calling again is a no-op.
    #[instrument(skip_all)]
    pub async fn initialize(&self) -> Result<usize, SchedulerError> {
        {
            let state = lock_state(&self.state);
            if state.initialized {
                return Ok(state.armed.len());
            }
        }
        self.reload().await
    }

    /// Re-read job definitions and re-arm them. In-flight runs keep the
    /// definition they started with.
    #[instrument(skip_all)]
    pub async fn reload(&self) -> Result<usize, SchedulerError> {
        let jobs = self.store.load_jobs(true).await?;
        let now = Utc::now();
        let mut persist = Vec::new();

        let armed_count = {
            let mut state = lock_state(&self.state);
            let mut armed = HashMap::with_capacity(jobs.len());

            for job in jobs {
                let schedule = match job.cron() {
                    Ok(schedule) => schedule,
                    Err(err) => {
                        warn!(job_id = %job.id, error = %err, "Skipping job with invalid schedule");
                        continue;
                    }
                };

                let next_run = match state.armed.get(&job.id) {
                    Some(previous) if previous.schedule == schedule => previous.next_run,
                    _ => {
                        let next = schedule.next_after(now, self.utc_offset);
                        persist.push((job.id, next));
                        next
                    }
                };

                armed.insert(
                    job.id,
                    ArmedJob {
                        job,
                        schedule,
                        next_run,
                    },
                );
            }

            state.armed = armed;
            state.initialized = true;
            state.armed.len()
        };

        for (job_id, next_run) in persist {
            if let Err(err) = self.store.update_next_run(job_id, next_run).await {
                warn!(job_id = %job_id, error = ?err, "Failed to persist next run");
            }
        }

        gauge!("sheetsync_scheduler_armed_jobs").set(armed_count as f64);
        info!(armed = armed_count, "Scheduler armed jobs");
        Ok(armed_count)
    }

    /// Spawn the scheduling loop. It stops on [`JobScheduler::shutdown`] or
    /// when `shutdown` fires.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let handle = tokio::spawn(Arc::clone(self).run(shutdown));
        if let Some(previous) = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }
    }

    /// Run the scheduling loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting job scheduler");

        loop {
            let budget = sleep_budget(self.next_due(), Utc::now(), self.tick_interval);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job scheduler shutdown requested");
                    break;
                }
                _ = self.disarm.cancelled() => {
                    info!("Job scheduler disarmed");
                    break;
                }
                _ = sleep(budget) => {
                    let tick_started = Instant::now();
                    self.tick(Utc::now()).await;
                    histogram!("sheetsync_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Job scheduler stopped");
    }

    /// Stop arming and firing jobs. Runs already in flight are left alone.
    pub async fn shutdown(&self) {
        self.disarm.cancel();
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            error!(error = ?err, "Scheduler loop ended abnormally");
        }
    }

    /// Wait until every run started by this scheduler has finished.
    pub async fn wait_idle(&self) {
        self.runs.close();
        self.runs.wait().await;
        self.runs.reopen();
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        lock_state(&self.state)
            .armed
            .values()
            .filter_map(|armed| armed.next_run)
            .min()
    }

    /// Fire every job due at `now`.
    async fn tick(&self, now: DateTime<Utc>) {
        let due: Vec<Uuid> = lock_state(&self.state)
            .armed
            .values()
            .filter(|armed| armed.next_run.is_some_and(|at| at <= now))
            .map(|armed| armed.job.id)
            .collect();

        for job_id in due {
            if let Err(err) = self.fire(job_id, now).await {
                error!(error = ?err, job_id = %job_id, "Failed to fire scheduled job");
                self.retry_next_tick(job_id, now);
            }
        }

        gauge!("sheetsync_scheduler_armed_jobs").set(lock_state(&self.state).armed.len() as f64);
    }

    /// Push a job whose firing failed one tick into the future.
    fn retry_next_tick(&self, job_id: Uuid, now: DateTime<Utc>) {
        let retry_at = chrono::Duration::from_std(self.tick_interval)
            .ok()
            .and_then(|tick| now.checked_add_signed(tick));
        if let Some(armed) = lock_state(&self.state).armed.get_mut(&job_id)
            && retry_at.is_some()
        {
            armed.next_run = retry_at;
        }
    }

    async fn fire(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let latest = self.store.load_job(job_id).await?;

        let job = {
            let mut state = lock_state(&self.state);
            let Some(job) = latest.filter(|job| job.enabled) else {
                state.armed.remove(&job_id);
                info!(job_id = %job_id, "Disarmed job that is gone or disabled");
                return Ok(());
            };
            let schedule = match job.cron() {
                Ok(schedule) => schedule,
                Err(err) => {
                    state.armed.remove(&job_id);
                    warn!(job_id = %job_id, error = %err, "Disarmed job with invalid schedule");
                    return Ok(());
                }
            };
            let next_run = schedule.next_after(now, self.utc_offset);
            state.armed.insert(
                job_id,
                ArmedJob {
                    job: job.clone(),
                    schedule,
                    next_run,
                },
            );
            job
        };

        match self.locks.try_acquire(job_id) {
            Some(guard) => {
                debug!(job_id = %job_id, "Firing scheduled job");
                self.spawn_run(job, guard);
            }
            None => {
                counter!("sheetsync_trigger_rejected_total").increment(1);
                info!(job_id = %job_id, "Scheduled firing skipped: job already running");
            }
        }
        Ok(())
    }

    fn spawn_run(&self, job: SyncJob, guard: RunLockGuard) {
        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        self.runs.spawn(async move {
            let log = executor.run(&job, guard).await;
            let armed_next_run = {
                let mut state = lock_state(&state);
                state.armed.get_mut(&job.id).map(|armed| {
                    armed.job.last_run = Some(log.start_time);
                    armed.job.status = match log.status {
                        RunStatus::Success => JobStatus::Success,
                        _ => JobStatus::Failed,
                    };
                    armed.next_run
                })
            };
            // The run wrote a next run from the definition it started with; a
            // reload during the run may have re-armed the job since.
            if let Some(next_run) = armed_next_run
                && let Err(err) = store.update_next_run(job.id, next_run).await
            {
                warn!(job_id = %job.id, error = ?err, "Failed to persist next run");
            }
        });
    }

    /// Start a run of `job_id` now unless one is already in flight.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn trigger(&self, job_id: Uuid) -> Result<TriggerResult, SchedulerError> {
        if self.locks.is_held(job_id) {
            counter!("sheetsync_trigger_rejected_total").increment(1);
            return Ok(TriggerResult::rejected(ALREADY_RUNNING));
        }

        let Some(job) = self.store.load_job(job_id).await? else {
            return Ok(TriggerResult::rejected(NOT_FOUND));
        };
        if !job.enabled {
            return Ok(TriggerResult::rejected(DISABLED));
        }

        let Some(guard) = self.locks.try_acquire(job_id) else {
            counter!("sheetsync_trigger_rejected_total").increment(1);
            return Ok(TriggerResult::rejected(ALREADY_RUNNING));
        };
        info!("Manual trigger accepted");
        self.spawn_run(job, guard);
        Ok(TriggerResult::accepted())
    }

    /// Runtime state of every armed or running job.
    pub fn get_scheduler_status(&self) -> BTreeMap<Uuid, JobRuntimeStatus> {
        let state = lock_state(&self.state);
        let mut status: BTreeMap<Uuid, JobRuntimeStatus> = state
            .armed
            .values()
            .map(|armed| {
                let running = self.locks.is_held(armed.job.id);
                (
                    armed.job.id,
                    JobRuntimeStatus {
                        running,
                        next_run: armed.next_run,
                        last_run: armed.job.last_run,
                        last_status: if running {
                            JobStatus::Running
                        } else {
                            armed.job.status
                        },
                    },
                )
            })
            .collect();

        for job_id in self.locks.held_ids() {
            status.entry(job_id).or_insert(JobRuntimeStatus {
                running: true,
                next_run: None,
                last_run: None,
                last_status: JobStatus::Running,
            });
        }
        status
    }

    /// Delete a job unless it is running.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<bool, SchedulerError> {
        let Some(_guard) = self.locks.try_acquire(job_id) else {
            return Err(SchedulerError::JobRunning { job_id });
        };
        let deleted = self.store.delete_job(job_id).await?;
        lock_state(&self.state).armed.remove(&job_id);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{MemorySheet, MemorySource, NoopNotifier};
    use crate::cursor::Cursor;
    use crate::models::{ExecutionLog, FieldMapping, MappingConfig, SyncMode, SyncSettings};
    use crate::repositories::JobRunState;
    use crate::sync_executor::ExecutorConfig;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, s).unwrap()
    }

    #[test]
    fn sleep_budget_is_bounded_by_tick() {
        let tick = Duration::from_secs(15);
        assert_eq!(sleep_budget(None, at(10, 0, 0), tick), tick);
        assert_eq!(sleep_budget(Some(at(11, 0, 0)), at(10, 0, 0), tick), tick);
        assert_eq!(
            sleep_budget(Some(at(10, 0, 5)), at(10, 0, 0), tick),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn overdue_job_fires_immediately() {
        let tick = Duration::from_secs(15);
        assert_eq!(
            sleep_budget(Some(at(9, 59, 0)), at(10, 0, 0), tick),
            Duration::ZERO
        );
    }

    /// Store that is down for everything, counting `load_job` calls.
    #[derive(Default)]
    struct DownStore {
        load_job_calls: AtomicUsize,
    }

    fn down() -> StoreError {
        StoreError::Corrupt("storage unavailable".to_string())
    }

    #[async_trait]
    impl JobStore for DownStore {
        async fn load_jobs(&self, _enabled_only: bool) -> Result<Vec<SyncJob>, StoreError> {
            Err(down())
        }
        async fn load_job(&self, _job_id: Uuid) -> Result<Option<SyncJob>, StoreError> {
            self.load_job_calls.fetch_add(1, Ordering::SeqCst);
            Err(down())
        }
        async fn save_job(&self, _job: &SyncJob) -> Result<(), StoreError> {
            Err(down())
        }
        async fn record_run_state(
            &self,
            _job_id: Uuid,
            _state: &JobRunState,
        ) -> Result<(), StoreError> {
            Err(down())
        }
        async fn update_status(&self, _job_id: Uuid, _status: JobStatus) -> Result<(), StoreError> {
            Err(down())
        }
        async fn update_next_run(
            &self,
            _job_id: Uuid,
            _next_run: Option<DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            Err(down())
        }
        async fn delete_job(&self, _job_id: Uuid) -> Result<bool, StoreError> {
            Err(down())
        }
        async fn load_cursor(&self, _job_id: Uuid) -> Result<Option<Cursor>, StoreError> {
            Err(down())
        }
        async fn save_cursor(&self, _job_id: Uuid, _cursor: &Cursor) -> Result<(), StoreError> {
            Err(down())
        }
        async fn clear_cursor(&self, _job_id: Uuid) -> Result<(), StoreError> {
            Err(down())
        }
        async fn append_execution_log(&self, _log: &ExecutionLog) -> Result<(), StoreError> {
            Err(down())
        }
        async fn update_execution_log(&self, _log: &ExecutionLog) -> Result<(), StoreError> {
            Err(down())
        }
        async fn finalize_execution_log(&self, _log: &ExecutionLog) -> Result<(), StoreError> {
            Err(down())
        }
        async fn list_execution_logs(
            &self,
            _job_id: Uuid,
            _limit: u64,
        ) -> Result<Vec<ExecutionLog>, StoreError> {
            Err(down())
        }
    }

    fn sample_job() -> SyncJob {
        let mapping = MappingConfig {
            source_table: "orders".to_string(),
            target_sheet_id: "sheet".to_string(),
            key_column: "id".to_string(),
            natural_key_field: "order_id".to_string(),
            fields: vec![FieldMapping::new("id", "order_id")],
        };
        SyncJob::new("orders", "* * * * *", mapping, SyncSettings::new(SyncMode::Full))
    }

    fn scheduler_over(store: Arc<DownStore>, tick: Duration) -> Arc<JobScheduler> {
        let executor = Arc::new(SyncExecutor::new(
            Arc::new(MemorySource::new()),
            Arc::new(MemorySheet::new()),
            store.clone() as Arc<dyn JobStore>,
            Arc::new(NoopNotifier),
            ExecutorConfig::default(),
        ));
        Arc::new(
            JobScheduler::new(store, executor, &SchedulerConfig::default())
                .with_tick_interval(tick),
        )
    }

    fn arm_overdue(scheduler: &JobScheduler, job: SyncJob) {
        let schedule = job.cron().unwrap();
        let mut state = lock_state(&scheduler.state);
        state.armed.insert(
            job.id,
            ArmedJob {
                job,
                schedule,
                next_run: Some(Utc::now() - chrono::Duration::seconds(1)),
            },
        );
        state.initialized = true;
    }

    #[tokio::test]
    async fn failed_fire_is_retried_next_tick() {
        let store = Arc::new(DownStore::default());
        let tick = Duration::from_millis(10);
        let scheduler = scheduler_over(store.clone(), tick);
        let job = sample_job();
        let job_id = job.id;
        arm_overdue(&scheduler, job);

        let now = Utc::now();
        scheduler.tick(now).await;

        assert_eq!(store.load_job_calls.load(Ordering::SeqCst), 1);
        let next_run = scheduler.get_scheduler_status()[&job_id].next_run.unwrap();
        assert_eq!(next_run, now + chrono::Duration::milliseconds(10));
    }

    #[tokio::test]
    async fn storage_outage_does_not_spin_the_loop() {
        let store = Arc::new(DownStore::default());
        let scheduler = scheduler_over(store.clone(), Duration::from_millis(50));
        arm_overdue(&scheduler, sample_job());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));
        sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // One attempt per tick, not a hot loop.
        let calls = store.load_job_calls.load(Ordering::SeqCst);
        assert!(calls >= 1, "job was never attempted");
        assert!(calls <= 10, "load_job called {calls} times in 300ms");
    }

    #[test]
    fn running_job_cannot_be_deleted_error_maps_to_conflict() {
        let api: ApiError = SchedulerError::JobRunning {
            job_id: Uuid::new_v4(),
        }
        .into();
        assert_eq!(api.status, axum::http::StatusCode::CONFLICT);
    }

    #[test]
    fn trigger_result_omits_reason_when_accepted() {
        let json = serde_json::to_value(TriggerResult::accepted()).unwrap();
        assert_eq!(json, serde_json::json!({ "accepted": true }));
        let json = serde_json::to_value(TriggerResult::rejected(ALREADY_RUNNING)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "accepted": false, "reason": "already running" })
        );
    }
}
