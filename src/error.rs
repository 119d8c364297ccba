//! # Error Handling
//!
//! Engine error taxonomy plus the problem+json [`ApiError`] used by the HTTP
//! surface.
//!
//! - [`ConfigurationError`]: a job definition that must never reach the executor.
//! - [`StoreError`]: failures of the job/cursor/log persistence layer.
//! - `SyncError` (in `connectors`): collaborator failures, classified for retry.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cursor::CursorError;
use crate::telemetry;

/// Rejected job definitions. Raised at save time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("job name cannot be empty")]
    MissingName,
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("source table is required")]
    MissingSourceTable,
    #[error("target sheet id is required")]
    MissingTargetSheet,
    #[error("key column is required")]
    MissingKeyColumn,
    #[error("field mapping must contain at least one field")]
    EmptyMapping,
    #[error("field mappings need both a source column and a target field")]
    BlankMappingColumn,
    #[error("target field '{field}' is mapped more than once")]
    DuplicateTargetField { field: String },
    #[error("natural key field '{field}' is not a mapped target field")]
    UnknownNaturalKey { field: String },
    #[error("conflict override refers to unmapped field '{field}'")]
    UnknownOverrideField { field: String },
    #[error("invalid validation pattern '{pattern}' on field '{field}': {reason}")]
    InvalidPattern {
        field: String,
        pattern: String,
        reason: String,
    },
    #[error("page size must be between 1 and {max}, got {value}")]
    InvalidPageSize { value: u32, max: u32 },
    #[error("max records per sync must be positive")]
    InvalidMaxRecords,
    #[error("sync timeout must be positive")]
    InvalidSyncTimeout,
    #[error("incremental mode requires an incremental field")]
    MissingIncrementalField,
}

/// Errors raised by the job, cursor and execution-log store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Cursor(#[from] CursorError),
    #[error("corrupt stored record: {0}")]
    Corrupt(String),
    #[error("execution log {log_id} is already finalized")]
    AlreadyFinalized { log_id: Uuid },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
}

/// Seconds a client should wait before retrying while the store is unreachable.
const STORE_RETRY_AFTER_SECS: u64 = 5;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    // Run id when raised inside a job run, otherwise a short correlation id.
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_run_id()
            .map(|run_id| run_id.to_string().into_boxed_str())
            .or_else(|| Some(format!("corr-{}", &Uuid::new_v4().to_string()[..8]).into_boxed_str()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
                .with_retry_after(STORE_RETRY_AFTER_SECS)
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Database(db) => db.into(),
            StoreError::Configuration(cfg) => validation_error(&cfg.to_string()),
            StoreError::NotFound { entity, id } => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("{entity} {id} not found"),
            ),
            StoreError::AlreadyFinalized { log_id } => Self::new(
                StatusCode::CONFLICT,
                "CONFLICT",
                &format!("execution log {log_id} is already finalized"),
            ),
            other => {
                tracing::error!(error = %other, "store error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Stored data could not be read",
                )
            }
        }
    }
}

pub fn not_found(message: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn conflict(message: &str) -> ApiError {
    ApiError::new(StatusCode::CONFLICT, "CONFLICT", message)
}

pub fn validation_error(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "Test error message",
        );

        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.message, Box::from("Test error message"));
        assert_eq!(error.details, None);
        assert_eq!(error.retry_after, None);
        assert!(error.trace_id.is_some());
    }

    #[test]
    fn test_api_error_with_details() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", "Test error message")
            .with_details(json!({"field": "value"}));

        assert_eq!(error.details, Some(Box::new(json!({"field": "value"}))));
    }

    #[test]
    fn test_unreachable_store_asks_client_to_retry() {
        let db = sea_orm::DbErr::Conn(sea_orm::RuntimeErr::Internal("refused".into()));
        let response = ApiError::from(StoreError::Database(db)).into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");
    }

    #[test]
    fn test_store_error_mapping() {
        let id = Uuid::new_v4();
        let api: ApiError = StoreError::NotFound { entity: "job", id }.into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);

        let api: ApiError = StoreError::Configuration(ConfigurationError::EmptyMapping).into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert!(api.message.contains("at least one field"));

        let api: ApiError = StoreError::AlreadyFinalized { log_id: id }.into();
        assert_eq!(api.status, StatusCode::CONFLICT);
    }

    #[test]
    fn test_content_type_and_retry_after_headers() {
        let response = conflict("already running").with_retry_after(5).into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");
    }
}
