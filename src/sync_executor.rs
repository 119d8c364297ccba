//! Sync Executor
//!
//! Runs one job end to end: takes the job's run lock, reads batches in fetch
//! order, resolves and writes them, and only then advances the cursor. Batch
//! failures are retried with exponential backoff; row-level problems are
//! recorded in the execution log and never abort the run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{AppConfig, ExecutorSettings};
use crate::conflict::{self, Resolution};
use crate::connectors::{
    Notifier, RowAck, RowWrite, RunOutcome, SheetWriter, SourceReader, SyncError,
};
use crate::cron::offset_from_minutes;
use crate::cursor::{CursorStore, WriteReceipt};
use crate::error::{ConfigurationError, StoreError};
use crate::fetcher::{BatchFetcher, StartPlan, plan_start};
use crate::field_resolver::{FieldResolver, ResolvedRow};
use crate::models::value::values_equal;
use crate::models::{
    ConflictStrategy, ExecutionLog, FieldOverride, JobStatus, Row, RunStatus, SyncJob, SyncMode,
    ValidationError,
};
use crate::repositories::{JobRunState, JobStore};
use crate::run_lock::{RunLockGuard, RunLocks};
use crate::telemetry::{RunContext, with_run_context};

/// Reason reported when a job's run lock is already held.
pub const ALREADY_RUNNING: &str = "already running";

/// Configuration for the sync executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Delay before the first retry of a batch; doubled per further attempt
    pub base_backoff: Duration,
    /// Upper bound on a single retry delay (before jitter)
    pub max_backoff: Duration,
    /// Fraction of the backoff added as random jitter
    pub jitter_factor: f64,
    /// Run timeout for jobs that do not set `sync_timeout_seconds`
    pub default_sync_timeout: Duration,
    /// Cap on validation errors kept per execution log
    pub max_validation_errors: usize,
    /// Bound on one notification call
    pub notify_timeout: Duration,
    /// Offset in which cron schedules are evaluated for `next_run`
    pub utc_offset: FixedOffset,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_settings(&ExecutorSettings::default(), 0)
    }
}

impl ExecutorConfig {
    pub fn from_settings(settings: &ExecutorSettings, utc_offset_minutes: i32) -> Self {
        Self {
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            jitter_factor: settings.jitter_factor,
            default_sync_timeout: Duration::from_secs(settings.default_sync_timeout_seconds),
            max_validation_errors: settings.max_validation_errors,
            notify_timeout: Duration::from_secs(settings.notify_timeout_seconds),
            utc_offset: offset_from_minutes(utc_offset_minutes),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::from_settings(&config.executor, config.scheduler.utc_offset_minutes)
    }
}

/// Why a run ended `failed`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("sync timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Row accounting for one written batch.
#[derive(Debug)]
struct BatchOutcome {
    succeeded: u64,
    failed: u64,
    skipped: u64,
    conflicts: u64,
    errors: Vec<ValidationError>,
    receipt: WriteReceipt,
}

/// Executes sync jobs against a source reader and a sheet writer
pub struct SyncExecutor {
    source: Arc<dyn SourceReader>,
    sheet: Arc<dyn SheetWriter>,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    cursors: CursorStore,
    config: ExecutorConfig,
}

impl SyncExecutor {
    pub fn new(
        source: Arc<dyn SourceReader>,
        sheet: Arc<dyn SheetWriter>,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            source,
            sheet,
            cursors: CursorStore::new(Arc::clone(&store)),
            store,
            notifier,
            config,
        }
    }

    /// Get the executor configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `job` unless another run of it holds the lock.
    ///
    /// A refused run returns a `skipped` log that is not persisted.
    pub async fn try_run(&self, job: &SyncJob, locks: &RunLocks) -> ExecutionLog {
        match locks.try_acquire(job.id) {
            Some(guard) => self.run(job, guard).await,
            None => {
                counter!("sheetsync_trigger_rejected_total").increment(1);
                info!(job_id = %job.id, job_name = %job.name, "Sync run skipped: job already running");
                ExecutionLog::skipped(job.id, ALREADY_RUNNING)
            }
        }
    }

    /// Run `job` while holding its lock. The lock is released once the log is
    /// finalized and the job's run state is recorded.
    pub async fn run(&self, job: &SyncJob, guard: RunLockGuard) -> ExecutionLog {
        let log = ExecutionLog::start(job.id);
        let span = info_span!(
            "sync_run",
            job_id = %job.id,
            job_name = %job.name,
            sync_mode = %job.sync.mode,
            run_id = %log.id,
        );
        let context = RunContext {
            job_id: job.id,
            run_id: log.id,
        };

        let work = async move {
            let log = self.execute(job, log).await;
            drop(guard);
            self.notify(job, &log).await;
            log
        };
        with_run_context(context, work.instrument(span)).await
    }

    async fn execute(&self, job: &SyncJob, mut log: ExecutionLog) -> ExecutionLog {
        info!("Starting sync run");

        let result = match self.store.append_execution_log(&log).await {
            Ok(()) => self.sync_batches(job, &mut log).await,
            Err(err) => Err(RunError::Store(err)),
        };

        let (status, job_status, error_message) = match &result {
            Ok(()) => (RunStatus::Success, JobStatus::Success, None),
            Err(err) => (RunStatus::Failed, JobStatus::Failed, Some(err.to_string())),
        };
        log.finish(status, error_message.clone());

        if let Err(err) = self.store.finalize_execution_log(&log).await {
            error!(error = ?err, "Failed to finalize execution log");
        }

        let next_run = job
            .cron()
            .ok()
            .and_then(|schedule| schedule.next_after(Utc::now(), self.config.utc_offset));
        let state = JobRunState {
            status: job_status,
            last_run: Some(log.start_time),
            next_run,
            last_error: error_message,
            retry_count: match status {
                RunStatus::Success => 0,
                _ => job.retry_count.saturating_add(1),
            },
        };
        if let Err(err) = self.store.record_run_state(job.id, &state).await {
            error!(error = ?err, "Failed to record job run state");
        }

        counter!("sheetsync_runs_total", "status" => status.as_str()).increment(1);
        histogram!("sheetsync_run_duration_ms").record(log.elapsed_ms() as f64);

        match &result {
            Ok(()) => info!(
                records_processed = log.records_processed,
                records_succeeded = log.records_succeeded,
                records_failed = log.records_failed,
                records_skipped = log.records_skipped,
                duration_ms = log.elapsed_ms(),
                "Sync run succeeded"
            ),
            Err(err) => error!(
                error = %err,
                records_processed = log.records_processed,
                duration_ms = log.elapsed_ms(),
                "Sync run failed"
            ),
        }

        log
    }

    /// Fetch, write and commit batches until the source is exhausted.
    async fn sync_batches(&self, job: &SyncJob, log: &mut ExecutionLog) -> Result<(), RunError> {
        let run_timeout = job.sync_timeout(self.config.default_sync_timeout);
        let deadline = Instant::now() + run_timeout;

        let plan = plan_start(job, self.cursors.load(job.id).await?);
        if matches!(plan, StartPlan::Fresh { reset: true }) {
            self.cursors.reset(job.id).await?;
        }

        let status = match (&plan, job.sync.mode) {
            (StartPlan::Resume(_), SyncMode::Paged) => JobStatus::Resuming,
            _ => JobStatus::Running,
        };
        self.store.update_status(job.id, status).await?;

        let resolver = FieldResolver::new(&job.mapping)?;
        let overrides = job.field_overrides();
        let mut fetcher = BatchFetcher::new(job, &plan);

        loop {
            if Instant::now() >= deadline {
                return Err(RunError::Timeout(run_timeout));
            }

            let mut attempt: u32 = 0;
            let (batch, outcome) = loop {
                let result = match timeout_at(deadline, fetcher.next_batch(self.source.as_ref()))
                    .await
                {
                    Err(_) => return Err(RunError::Timeout(run_timeout)),
                    Ok(Ok(None)) => return Ok(()),
                    Ok(Ok(Some(batch))) => self
                        .process_batch(job, &resolver, &overrides, &batch.rows)
                        .await
                        .map(|outcome| (batch, outcome)),
                    Ok(Err(err)) => Err(err),
                };

                match result {
                    Ok(done) => break done,
                    Err(err) if !err.is_retryable() || attempt >= job.max_retries => {
                        return Err(err.into());
                    }
                    Err(err) => {
                        let backoff = self.backoff(&err, attempt);
                        if Instant::now() + backoff >= deadline {
                            return Err(RunError::Timeout(run_timeout));
                        }
                        attempt += 1;
                        counter!("sheetsync_batch_retries_total").increment(1);
                        warn!(
                            error = %err,
                            attempt,
                            max_retries = job.max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            "Batch failed; retrying"
                        );
                        sleep(backoff).await;
                    }
                }
            };

            log.records_processed += batch.rows.len() as u64;
            log.records_succeeded += outcome.succeeded;
            log.records_failed += outcome.failed;
            log.records_skipped += outcome.skipped;
            log.conflict_count += outcome.conflicts;
            log.retry_attempt = log.retry_attempt.max(attempt);
            log.push_validation_errors(outcome.errors, self.config.max_validation_errors);

            let advance = batch.pending.confirm(&outcome.receipt);
            self.cursors
                .advance(|a, b| self.source.compare_keys(a, b), advance)
                .await?;
            fetcher.commit(batch.step);

            counter!("sheetsync_rows_written_total").increment(outcome.succeeded);
            debug!(
                rows = batch.rows.len(),
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                skipped = outcome.skipped,
                retry_attempt = attempt,
                "Batch committed"
            );

            if let Err(err) = self.store.update_execution_log(log).await {
                warn!(error = ?err, "Failed to persist execution log progress");
            }
        }
    }

    /// Resolve, reconcile and write one batch. Existing target rows are read
    /// on every attempt so retries see current target state.
    async fn process_batch(
        &self,
        job: &SyncJob,
        resolver: &FieldResolver,
        overrides: &[FieldOverride],
        rows: &[Row],
    ) -> Result<BatchOutcome, SyncError> {
        let key_field = job.mapping.natural_key_field.as_str();
        let sheet_id = job.mapping.target_sheet_id.as_str();
        let mut failed = 0u64;
        let mut skipped = 0u64;
        let mut conflicts = 0u64;
        let mut errors = Vec::new();

        let mut resolved = Vec::with_capacity(rows.len());
        for row in rows {
            let ResolvedRow {
                fields,
                errors: row_errors,
                blocked,
            } = resolver.resolve_row(row);
            errors.extend(row_errors);
            if blocked {
                failed += 1;
            } else {
                resolved.push(fields);
            }
        }

        let existing = if job.conflict.strategy == ConflictStrategy::Append {
            Vec::new()
        } else {
            let keys: Vec<_> = resolved
                .iter()
                .filter_map(|fields| fields.get(key_field).cloned())
                .collect();
            if keys.is_empty() {
                Vec::new()
            } else {
                self.sheet.find_by_keys(sheet_id, key_field, &keys).await?
            }
        };

        let mut writes = Vec::with_capacity(resolved.len());
        for fields in &resolved {
            let key = fields.get(key_field).cloned();
            let current = key.as_ref().and_then(|k| {
                existing
                    .iter()
                    .find(|row| row.get(key_field).is_some_and(|v| values_equal(v, k)))
            });

            match conflict::resolve(fields, current, key_field, job.conflict.strategy, overrides) {
                Resolution::Write {
                    row,
                    op,
                    conflicted,
                } => {
                    if conflicted {
                        conflicts += 1;
                    }
                    writes.push(RowWrite { op, fields: row });
                }
                Resolution::Skip { reason } => {
                    debug!(row_key = ?key, reason = reason.as_str(), "Row skipped");
                    skipped += 1;
                }
                Resolution::Conflict { fields: differing } => {
                    failed += 1;
                    conflicts += 1;
                    errors.push(
                        ValidationError::error(
                            key_field,
                            key.clone().unwrap_or_default(),
                            format!(
                                "conflicts with existing target row on {}",
                                differing.join(", ")
                            ),
                        )
                        .with_row_key(key),
                    );
                }
            }
        }

        if writes.is_empty() {
            return Ok(BatchOutcome {
                succeeded: 0,
                failed,
                skipped,
                conflicts,
                errors,
                receipt: WriteReceipt::empty(),
            });
        }

        let acks = self.sheet.upsert(sheet_id, &writes, key_field).await?;
        if acks.len() != writes.len() {
            return Err(SyncError::permanent(format!(
                "target acknowledged {} of {} rows",
                acks.len(),
                writes.len()
            )));
        }

        let mut succeeded = 0u64;
        for (write, ack) in writes.iter().zip(&acks) {
            match ack {
                RowAck::Accepted => succeeded += 1,
                RowAck::Rejected { reason } => {
                    failed += 1;
                    let key = write.fields.get(key_field).cloned();
                    errors.push(
                        ValidationError::error(
                            key_field,
                            key.clone().unwrap_or_default(),
                            format!("rejected by target: {reason}"),
                        )
                        .with_row_key(key),
                    );
                }
            }
        }

        Ok(BatchOutcome {
            succeeded,
            failed,
            skipped,
            conflicts,
            errors,
            receipt: WriteReceipt::from_acks(&acks),
        })
    }

    /// Delay before retry number `attempt + 1`.
    fn backoff(&self, error: &SyncError, attempt: u32) -> Duration {
        let base = self.config.base_backoff.as_secs_f64();
        let max = self.config.max_backoff.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut backoff = (base * 2_f64.powi(exponent)).min(max);

        // Honour the server's Retry-After even above the cap.
        if let Some(retry_after) = error.retry_after_secs() {
            backoff = backoff.max(retry_after as f64);
        }

        let spread = self.config.jitter_factor * backoff;
        let jitter = if spread > 0.0 {
            thread_rng().gen_range(0.0..spread)
        } else {
            0.0
        };
        Duration::from_secs_f64(backoff + jitter)
    }

    async fn notify(&self, job: &SyncJob, log: &ExecutionLog) {
        let outcome = match log.status {
            RunStatus::Success => RunOutcome::Success,
            RunStatus::Failed => RunOutcome::Failed,
            RunStatus::Running | RunStatus::Skipped => return,
        };

        match timeout(
            self.config.notify_timeout,
            self.notifier.notify(&job.name, outcome, log),
        )
        .await
        {
            Ok(Ok(())) => debug!("Run outcome notified"),
            Ok(Err(err)) => warn!(error = %err, "Failed to notify run outcome"),
            Err(_) => warn!(
                timeout_secs = self.config.notify_timeout.as_secs(),
                "Notification timed out"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{MemorySheet, MemorySource, NoopNotifier};
    use crate::models::{FieldMapping, MappingConfig, SyncSettings};
    use crate::repositories::SeaOrmJobStore;
    use sea_orm::Database;

    async fn executor(config: ExecutorConfig) -> SyncExecutor {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        SyncExecutor::new(
            Arc::new(MemorySource::new()),
            Arc::new(MemorySheet::new()),
            Arc::new(SeaOrmJobStore::new(Arc::new(db))),
            Arc::new(NoopNotifier),
            config,
        )
    }

    fn no_jitter() -> ExecutorConfig {
        ExecutorConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
            jitter_factor: 0.0,
            ..ExecutorConfig::default()
        }
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let exec = executor(no_jitter()).await;
        let err = SyncError::transient("boom");
        assert_eq!(exec.backoff(&err, 0), Duration::from_millis(100));
        assert_eq!(exec.backoff(&err, 1), Duration::from_millis(200));
        assert_eq!(exec.backoff(&err, 3), Duration::from_millis(800));
        assert_eq!(exec.backoff(&err, 10), Duration::from_millis(1_000));
        assert_eq!(exec.backoff(&err, u32::MAX), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn backoff_honours_retry_after() {
        let exec = executor(no_jitter()).await;
        let err = SyncError::rate_limited(Some(3));
        assert_eq!(exec.backoff(&err, 0), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn backoff_jitter_stays_within_factor() {
        let exec = executor(ExecutorConfig {
            jitter_factor: 0.5,
            ..no_jitter()
        })
        .await;
        let err = SyncError::transient("boom");
        for _ in 0..50 {
            let delay = exec.backoff(&err, 1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn held_lock_skips_without_touching_store() {
        let exec = executor(no_jitter()).await;
        let mapping = MappingConfig {
            source_table: "orders".into(),
            target_sheet_id: "sheet".into(),
            key_column: "id".into(),
            natural_key_field: "order_id".into(),
            fields: vec![FieldMapping::new("id", "order_id")],
        };
        let job = SyncJob::new("orders", "*/5 * * * *", mapping, SyncSettings::new(SyncMode::Full));
        let locks = RunLocks::new();
        let _held = locks.try_acquire(job.id).unwrap();

        let log = exec.try_run(&job, &locks).await;
        assert_eq!(log.status, RunStatus::Skipped);
        assert_eq!(log.error_message.as_deref(), Some(ALREADY_RUNNING));
        assert!(locks.is_held(job.id));
    }

    #[test]
    fn config_follows_settings() {
        let settings = ExecutorSettings {
            base_backoff_ms: 250,
            default_sync_timeout_seconds: 60,
            ..ExecutorSettings::default()
        };
        let config = ExecutorConfig::from_settings(&settings, 480);
        assert_eq!(config.base_backoff, Duration::from_millis(250));
        assert_eq!(config.default_sync_timeout, Duration::from_secs(60));
        assert_eq!(config.utc_offset.local_minus_utc(), 480 * 60);
    }

    #[test]
    fn timeout_error_names_the_limit() {
        let err = RunError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "sync timed out after 30s");
    }
}
