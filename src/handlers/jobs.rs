//! # Jobs API Handlers
//!
//! Scheduler status, manual triggers, execution history and reload.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, not_found, validation_error};
use crate::models::ExecutionLog;
use crate::scheduler::{JobRuntimeStatus, NOT_FOUND, TriggerResult};
use crate::server::AppState;

const DEFAULT_LOG_LIMIT: u64 = 20;
const MAX_LOG_LIMIT: u64 = 100;

/// Runtime state of every armed or running job, keyed by job id
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SchedulerStatusResponse {
    pub jobs: BTreeMap<String, JobRuntimeStatus>,
}

/// Query parameters for listing execution logs
#[derive(Debug, Deserialize)]
pub struct ListLogsQuery {
    /// Maximum number of logs to return (default: 20, max: 100)
    pub limit: Option<u64>,
}

/// Execution history of one job, newest first
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ExecutionLogsResponse {
    pub logs: Vec<ExecutionLog>,
}

/// Result of re-reading job definitions
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReloadResponse {
    /// Number of jobs armed after the reload
    #[schema(example = 3)]
    pub armed: usize,
}

/// Scheduler status endpoint
#[utoipa::path(
    get,
    path = "/scheduler/status",
    responses(
        (status = 200, description = "Runtime state per job", body = SchedulerStatusResponse)
    ),
    tag = "scheduler"
)]
pub async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatusResponse> {
    let jobs = state
        .scheduler
        .get_scheduler_status()
        .into_iter()
        .map(|(job_id, status)| (job_id.to_string(), status))
        .collect();
    Json(SchedulerStatusResponse { jobs })
}

/// Manually trigger a job run
#[utoipa::path(
    post,
    path = "/jobs/{id}/trigger",
    params(("id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 202, description = "Run started", body = TriggerResult),
        (status = 404, description = "Unknown job", body = TriggerResult),
        (status = 409, description = "Job already running or disabled", body = TriggerResult),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn trigger_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<TriggerResult>), ApiError> {
    let result = state.scheduler.trigger(job_id).await?;
    let status = match (result.accepted, result.reason.as_deref()) {
        (true, _) => StatusCode::ACCEPTED,
        (false, Some(NOT_FOUND)) => StatusCode::NOT_FOUND,
        (false, _) => StatusCode::CONFLICT,
    };
    info!(job_id = %job_id, accepted = result.accepted, reason = ?result.reason, "Manual trigger handled");
    Ok((status, Json(result)))
}

fn limit_error(message: &str) -> ApiError {
    validation_error(message).with_details(json!({
        "field": "limit",
        "min": 1,
        "max": MAX_LOG_LIMIT,
    }))
}

/// List execution logs of a job
#[utoipa::path(
    get,
    path = "/jobs/{id}/logs",
    params(
        ("id" = Uuid, Path, description = "Job identifier"),
        ("limit" = Option<u64>, Query, description = "Maximum number of logs to return (default 20, max 100)")
    ),
    responses(
        (status = 200, description = "Execution logs, newest first", body = ExecutionLogsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 404, description = "Unknown job", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_job_logs(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(params): Query<ListLogsQuery>,
) -> Result<Json<ExecutionLogsResponse>, ApiError> {
    let limit = match params.limit {
        None => DEFAULT_LOG_LIMIT,
        Some(0) => return Err(limit_error("Minimum allowed limit is 1")),
        Some(limit) if limit > MAX_LOG_LIMIT => {
            return Err(limit_error("Maximum allowed limit is 100"));
        }
        Some(limit) => limit,
    };

    if state.store.load_job(job_id).await?.is_none() {
        return Err(not_found(&format!("job {job_id} not found")));
    }

    let logs = state.store.list_execution_logs(job_id, limit).await?;
    Ok(Json(ExecutionLogsResponse { logs }))
}

/// Re-read job definitions into the scheduler
#[utoipa::path(
    post,
    path = "/scheduler/reload",
    responses(
        (status = 200, description = "Jobs re-armed", body = ReloadResponse),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "scheduler"
)]
pub async fn reload_scheduler(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let armed = state.scheduler.reload().await?;
    Ok(Json(ReloadResponse { armed }))
}
