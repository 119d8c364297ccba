//! Job, cursor and execution-log persistence
//!
//! The [`JobStore`] trait is the persistence collaborator of the engine;
//! [`SeaOrmJobStore`] implements it over the `sync_jobs`, `sync_cursors` and
//! `execution_logs` tables.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, NotSet, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::error::StoreError;
use crate::models::execution_log::{self, Entity as ExecutionLogEntity};
use crate::models::sync_cursor::{self, Entity as SyncCursorEntity};
use crate::models::sync_job::{self, Entity as SyncJobEntity};
use crate::models::{ExecutionLog, JobStatus, RunStatus, SyncJob, ValidationError};

/// Run state written back to a job after each run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRunState {
    pub status: JobStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// Persistence collaborator for job definitions, cursors and run history.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_jobs(&self, enabled_only: bool) -> Result<Vec<SyncJob>, StoreError>;

    async fn load_job(&self, job_id: Uuid) -> Result<Option<SyncJob>, StoreError>;

    /// Validate and insert or replace a job definition.
    async fn save_job(&self, job: &SyncJob) -> Result<(), StoreError>;

    async fn record_run_state(&self, job_id: Uuid, state: &JobRunState) -> Result<(), StoreError>;

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError>;

    async fn update_next_run(
        &self,
        job_id: Uuid,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Remove a job with its cursor and history. Returns false if it did not exist.
    async fn delete_job(&self, job_id: Uuid) -> Result<bool, StoreError>;

    async fn load_cursor(&self, job_id: Uuid) -> Result<Option<Cursor>, StoreError>;

    async fn save_cursor(&self, job_id: Uuid, cursor: &Cursor) -> Result<(), StoreError>;

    async fn clear_cursor(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn append_execution_log(&self, log: &ExecutionLog) -> Result<(), StoreError>;

    /// Update a log that is still open.
    async fn update_execution_log(&self, log: &ExecutionLog) -> Result<(), StoreError>;

    /// Write the final state of a log and freeze it.
    async fn finalize_execution_log(&self, log: &ExecutionLog) -> Result<(), StoreError>;

    /// Most recent logs first.
    async fn list_execution_logs(
        &self,
        job_id: Uuid,
        limit: u64,
    ) -> Result<Vec<ExecutionLog>, StoreError>;
}

/// `JobStore` over SeaORM.
#[derive(Debug, Clone)]
pub struct SeaOrmJobStore {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl SeaOrmJobStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or_default()
}

fn job_from_model(model: sync_job::Model) -> Result<SyncJob, StoreError> {
    let status = JobStatus::from_str(&model.status).map_err(StoreError::Corrupt)?;
    Ok(SyncJob {
        id: model.id,
        name: model.name,
        schedule: model.schedule,
        enabled: model.enabled,
        mapping: serde_json::from_value(model.mapping)?,
        sync: serde_json::from_value(model.sync_settings)?,
        conflict: serde_json::from_value(model.conflict_settings)?,
        max_retries: u32::try_from(model.max_retries).unwrap_or_default(),
        retry_count: u32::try_from(model.retry_count).unwrap_or_default(),
        status,
        last_run: model.last_run.map(|dt| dt.with_timezone(&Utc)),
        next_run: model.next_run.map(|dt| dt.with_timezone(&Utc)),
        last_error: model.last_error,
    })
}

fn log_from_model(model: execution_log::Model) -> Result<ExecutionLog, StoreError> {
    let status = RunStatus::parse(&model.status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown run status '{}'", model.status)))?;
    let validation_errors: Vec<ValidationError> = match model.validation_errors {
        Some(value) => serde_json::from_value(value)?,
        None => Vec::new(),
    };
    Ok(ExecutionLog {
        id: model.id,
        job_id: model.job_id,
        status,
        start_time: model.start_time.with_timezone(&Utc),
        end_time: model.end_time.map(|dt| dt.with_timezone(&Utc)),
        duration_ms: model.duration_ms,
        records_processed: to_u64(model.records_processed),
        records_succeeded: to_u64(model.records_succeeded),
        records_failed: to_u64(model.records_failed),
        records_skipped: to_u64(model.records_skipped),
        retry_attempt: u32::try_from(model.retry_attempt).unwrap_or_default(),
        conflict_count: to_u64(model.conflict_count),
        error_message: model.error_message,
        validation_errors,
    })
}

/// Active model carrying every mutable column of a log.
fn log_active_model(
    log: &ExecutionLog,
    finalized: bool,
) -> Result<execution_log::ActiveModel, StoreError> {
    let validation_errors = if log.validation_errors.is_empty() {
        None
    } else {
        Some(serde_json::to_value(&log.validation_errors)?)
    };
    Ok(execution_log::ActiveModel {
        id: NotSet,
        job_id: NotSet,
        status: Set(log.status.as_str().to_string()),
        start_time: Set(log.start_time.fixed_offset()),
        end_time: Set(log.end_time.map(|dt| dt.fixed_offset())),
        duration_ms: Set(log.duration_ms),
        records_processed: Set(to_i64(log.records_processed)),
        records_succeeded: Set(to_i64(log.records_succeeded)),
        records_failed: Set(to_i64(log.records_failed)),
        records_skipped: Set(to_i64(log.records_skipped)),
        retry_attempt: Set(i32::try_from(log.retry_attempt).unwrap_or(i32::MAX)),
        conflict_count: Set(to_i64(log.conflict_count)),
        error_message: Set(log.error_message.clone()),
        validation_errors: Set(validation_errors),
        finalized: Set(finalized),
    })
}

impl SeaOrmJobStore {
    /// Update an open log; distinguishes a missing log from a frozen one.
    async fn write_open_log(&self, log: &ExecutionLog, finalize: bool) -> Result<(), StoreError> {
        let result = ExecutionLogEntity::update_many()
            .set(log_active_model(log, finalize)?)
            .filter(execution_log::Column::Id.eq(log.id))
            .filter(execution_log::Column::Finalized.eq(false))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected > 0 {
            return Ok(());
        }

        match ExecutionLogEntity::find_by_id(log.id)
            .one(self.db.as_ref())
            .await?
        {
            Some(_) => Err(StoreError::AlreadyFinalized { log_id: log.id }),
            None => Err(StoreError::NotFound {
                entity: "execution log",
                id: log.id,
            }),
        }
    }
}

#[async_trait]
impl JobStore for SeaOrmJobStore {
    async fn load_jobs(&self, enabled_only: bool) -> Result<Vec<SyncJob>, StoreError> {
        let mut query = SyncJobEntity::find().order_by_asc(sync_job::Column::CreatedAt);
        if enabled_only {
            query = query.filter(sync_job::Column::Enabled.eq(true));
        }
        query
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(job_from_model)
            .collect()
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<SyncJob>, StoreError> {
        SyncJobEntity::find_by_id(job_id)
            .one(self.db.as_ref())
            .await?
            .map(job_from_model)
            .transpose()
    }

    async fn save_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        job.validate()?;

        let now = Utc::now().fixed_offset();
        let existing = SyncJobEntity::find_by_id(job.id)
            .one(self.db.as_ref())
            .await?;

        let mut model = sync_job::ActiveModel {
            id: Set(job.id),
            name: Set(job.name.clone()),
            schedule: Set(job.schedule.clone()),
            sync_mode: Set(job.sync.mode.as_str().to_string()),
            enabled: Set(job.enabled),
            mapping: Set(serde_json::to_value(&job.mapping)?),
            sync_settings: Set(serde_json::to_value(&job.sync)?),
            conflict_settings: Set(serde_json::to_value(&job.conflict)?),
            max_retries: Set(i32::try_from(job.max_retries).unwrap_or(i32::MAX)),
            retry_count: Set(i32::try_from(job.retry_count).unwrap_or(i32::MAX)),
            status: Set(job.status.as_str().to_string()),
            last_run: Set(job.last_run.map(|dt| dt.fixed_offset())),
            next_run: Set(job.next_run.map(|dt| dt.fixed_offset())),
            last_error: Set(job.last_error.clone()),
            created_at: NotSet,
            updated_at: Set(now),
        };

        if existing.is_some() {
            model.update(self.db.as_ref()).await?;
        } else {
            model.created_at = Set(now);
            SyncJobEntity::insert(model)
                .exec_without_returning(self.db.as_ref())
                .await?;
        }

        debug!(job_id = %job.id, name = %job.name, "job definition saved");
        Ok(())
    }

    async fn record_run_state(&self, job_id: Uuid, state: &JobRunState) -> Result<(), StoreError> {
        let model = sync_job::ActiveModel {
            status: Set(state.status.as_str().to_string()),
            last_run: Set(state.last_run.map(|dt| dt.fixed_offset())),
            next_run: Set(state.next_run.map(|dt| dt.fixed_offset())),
            last_error: Set(state.last_error.clone()),
            retry_count: Set(i32::try_from(state.retry_count).unwrap_or(i32::MAX)),
            updated_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };
        let result = SyncJobEntity::update_many()
            .set(model)
            .filter(sync_job::Column::Id.eq(job_id))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(StoreError::NotFound {
                entity: "job",
                id: job_id,
            });
        }
        Ok(())
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let model = sync_job::ActiveModel {
            status: Set(status.as_str().to_string()),
            updated_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };
        let result = SyncJobEntity::update_many()
            .set(model)
            .filter(sync_job::Column::Id.eq(job_id))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(StoreError::NotFound {
                entity: "job",
                id: job_id,
            });
        }
        Ok(())
    }

    async fn update_next_run(
        &self,
        job_id: Uuid,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let model = sync_job::ActiveModel {
            next_run: Set(next_run.map(|dt| dt.fixed_offset())),
            ..Default::default()
        };
        SyncJobEntity::update_many()
            .set(model)
            .filter(sync_job::Column::Id.eq(job_id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let txn = self.db.begin().await?;
        ExecutionLogEntity::delete_many()
            .filter(execution_log::Column::JobId.eq(job_id))
            .exec(&txn)
            .await?;
        SyncCursorEntity::delete_by_id(job_id).exec(&txn).await?;
        let result = SyncJobEntity::delete_by_id(job_id).exec(&txn).await?;
        txn.commit().await?;
        Ok(result.rows_affected > 0)
    }

    async fn load_cursor(&self, job_id: Uuid) -> Result<Option<Cursor>, StoreError> {
        let Some(model) = SyncCursorEntity::find_by_id(job_id)
            .one(self.db.as_ref())
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(Cursor::decode(&model.position)?))
    }

    async fn save_cursor(&self, job_id: Uuid, cursor: &Cursor) -> Result<(), StoreError> {
        let model = sync_cursor::ActiveModel {
            job_id: Set(job_id),
            position: Set(cursor.encode()?),
            updated_at: Set(Utc::now().fixed_offset()),
        };
        SyncCursorEntity::insert(model)
            .on_conflict(
                OnConflict::column(sync_cursor::Column::JobId)
                    .update_columns([sync_cursor::Column::Position, sync_cursor::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn clear_cursor(&self, job_id: Uuid) -> Result<(), StoreError> {
        SyncCursorEntity::delete_by_id(job_id)
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn append_execution_log(&self, log: &ExecutionLog) -> Result<(), StoreError> {
        let mut model = log_active_model(log, false)?;
        model.id = Set(log.id);
        model.job_id = Set(log.job_id);
        ExecutionLogEntity::insert(model)
            .exec_without_returning(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn update_execution_log(&self, log: &ExecutionLog) -> Result<(), StoreError> {
        self.write_open_log(log, false).await
    }

    async fn finalize_execution_log(&self, log: &ExecutionLog) -> Result<(), StoreError> {
        self.write_open_log(log, true).await
    }

    async fn list_execution_logs(
        &self,
        job_id: Uuid,
        limit: u64,
    ) -> Result<Vec<ExecutionLog>, StoreError> {
        ExecutionLogEntity::find()
            .filter(execution_log::Column::JobId.eq(job_id))
            .order_by_desc(execution_log::Column::StartTime)
            .limit(limit)
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(log_from_model)
            .collect()
    }
}
