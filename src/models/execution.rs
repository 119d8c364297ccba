//! Execution history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use super::job::Severity;

/// Outcome state of one run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    /// Returned to callers when the job was already running; never persisted.
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// A per-field data problem recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ValidationError {
    pub field: String,
    pub value: Value,
    pub message: String,
    pub severity: Severity,
    /// Natural key of the offending row, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_key: Option<Value>,
}

impl ValidationError {
    pub fn error(field: impl Into<String>, value: Value, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value,
            message: message.into(),
            severity: Severity::Error,
            row_key: None,
        }
    }

    pub fn warning(field: impl Into<String>, value: Value, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(field, value, message)
        }
    }

    pub fn with_row_key(mut self, key: Option<Value>) -> Self {
        self.row_key = key;
        self
    }
}

/// One record per job run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub records_processed: u64,
    pub records_succeeded: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    /// Highest retry count any batch needed.
    pub retry_attempt: u32,
    pub conflict_count: u64,
    pub error_message: Option<String>,
    pub validation_errors: Vec<ValidationError>,
}

impl ExecutionLog {
    pub fn start(job_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            records_processed: 0,
            records_succeeded: 0,
            records_failed: 0,
            records_skipped: 0,
            retry_attempt: 0,
            conflict_count: 0,
            error_message: None,
            validation_errors: Vec::new(),
        }
    }

    /// Log returned when a run was refused because one is already in flight.
    pub fn skipped(job_id: Uuid, reason: impl Into<String>) -> Self {
        let mut log = Self::start(job_id);
        log.status = RunStatus::Skipped;
        log.end_time = Some(log.start_time);
        log.duration_ms = Some(0);
        log.error_message = Some(reason.into());
        log
    }

    /// Milliseconds elapsed so far, or the final duration once finished.
    pub fn elapsed_ms(&self) -> i64 {
        self.duration_ms
            .unwrap_or_else(|| (Utc::now() - self.start_time).num_milliseconds())
    }

    pub fn finish(&mut self, status: RunStatus, error_message: Option<String>) {
        let end = Utc::now();
        self.status = status;
        self.end_time = Some(end);
        self.duration_ms = Some((end - self.start_time).num_milliseconds().max(0));
        self.error_message = error_message;
    }

    /// Record validation errors up to `cap` entries.
    pub fn push_validation_errors(
        &mut self,
        errors: impl IntoIterator<Item = ValidationError>,
        cap: usize,
    ) {
        for e in errors {
            if self.validation_errors.len() >= cap {
                break;
            }
            self.validation_errors.push(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn skipped_log_is_terminal_with_reason() {
        let log = ExecutionLog::skipped(Uuid::new_v4(), "already running");
        assert_eq!(log.status, RunStatus::Skipped);
        assert!(log.status.is_terminal());
        assert_eq!(log.error_message.as_deref(), Some("already running"));
        assert_eq!(log.duration_ms, Some(0));
    }

    #[test]
    fn validation_errors_are_capped() {
        let mut log = ExecutionLog::start(Uuid::new_v4());
        let errors = (0..10).map(|i| ValidationError::warning("f", json!(i), "bad"));
        log.push_validation_errors(errors, 3);
        assert_eq!(log.validation_errors.len(), 3);
    }

    #[test]
    fn finish_sets_duration() {
        let mut log = ExecutionLog::start(Uuid::new_v4());
        log.finish(RunStatus::Failed, Some("boom".into()));
        assert_eq!(log.status, RunStatus::Failed);
        assert!(log.end_time.is_some());
        assert!(log.duration_ms.unwrap() >= 0);
    }
}
