//! Collaborator contracts
//!
//! Interfaces the sync engine consumes: a row source, a sheet writer and a run
//! notifier, together with the error types used to classify their failures.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::value::compare_values;
use crate::models::{ExecutionLog, Row};

/// Connector-specific error types for structured error handling
#[derive(Debug, Clone)]
pub enum ConnectorError {
    /// HTTP error from an upstream API
    HttpError {
        status: u16,
        body: Option<String>,
        retry_after: Option<u64>,
    },
    /// Upstream accepted the request but answered with an error code
    RemoteError { code: i64, message: String },
    /// Malformed response from upstream
    MalformedResponse { details: String },
    /// Network or connectivity error
    NetworkError { details: String, retryable: bool },
    /// Request exceeded its deadline
    Timeout { details: String },
    /// Configuration or setup error
    ConfigurationError { details: String },
}

/// Collaborator failure classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Transient/retryable error
    Transient,
    /// Rate limited with optional retry after hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// A call or the run itself exceeded its time budget
    Timeout,
    /// Permanent/non-retryable error
    Permanent,
}

impl SyncError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Transient,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self {
            kind: SyncErrorKind::RateLimited { retry_after_secs },
            message: None,
            details: None,
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Timeout,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Permanent,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the failed batch may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, SyncErrorKind::Permanent)
    }

    /// Server-provided lower bound on the next attempt.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self.kind {
            SyncErrorKind::RateLimited { retry_after_secs } => retry_after_secs,
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::HttpError { status, body, .. } => {
                write!(
                    f,
                    "HTTP error {}: {}",
                    status,
                    body.as_deref().unwrap_or("No body")
                )
            }
            ConnectorError::RemoteError { code, message } => {
                write!(f, "Remote error {}: {}", code, message)
            }
            ConnectorError::MalformedResponse { details } => {
                write!(f, "Malformed response: {}", details)
            }
            ConnectorError::NetworkError { details, .. } => {
                write!(f, "Network error: {}", details)
            }
            ConnectorError::Timeout { details } => write!(f, "Timeout: {}", details),
            ConnectorError::ConfigurationError { details } => {
                write!(f, "Configuration error: {}", details)
            }
        }
    }
}

impl std::error::Error for ConnectorError {}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SyncErrorKind::Transient => write!(f, "Transient error")?,
            SyncErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
            }
            SyncErrorKind::Timeout => write!(f, "Timeout")?,
            SyncErrorKind::Permanent => write!(f, "Permanent error")?,
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

/// WeCom open API answers "api freq out of limit" with these codes.
const WECOM_RATE_LIMIT_CODES: &[i64] = &[45009, 45011, 45033];

impl From<ConnectorError> for SyncError {
    fn from(connector_error: ConnectorError) -> Self {
        match connector_error {
            ConnectorError::HttpError {
                status,
                body,
                retry_after,
            } => {
                if status == 429 {
                    SyncError::rate_limited(retry_after)
                } else if status == 408 {
                    SyncError::timeout(format!("HTTP error {}", status))
                } else if (400..500).contains(&status) {
                    SyncError::permanent(format!(
                        "HTTP error {}: {}",
                        status,
                        body.unwrap_or_default()
                    ))
                } else {
                    SyncError::transient(format!(
                        "HTTP error {}: {}",
                        status,
                        body.unwrap_or_default()
                    ))
                }
            }
            ConnectorError::RemoteError { code, message } => {
                if WECOM_RATE_LIMIT_CODES.contains(&code) {
                    SyncError::rate_limited(None)
                        .with_details(serde_json::json!({ "code": code, "message": message }))
                } else if code == -1 {
                    // system busy
                    SyncError::transient(format!("Remote error {}: {}", code, message))
                } else {
                    SyncError::permanent(format!("Remote error {}: {}", code, message))
                }
            }
            ConnectorError::NetworkError { details, retryable } => {
                if retryable {
                    SyncError::transient(details)
                } else {
                    SyncError::permanent(details)
                }
            }
            ConnectorError::Timeout { details } => SyncError::timeout(details),
            ConnectorError::MalformedResponse { details } => {
                SyncError::transient(format!("Malformed response: {}", details))
            }
            ConnectorError::ConfigurationError { details } => {
                SyncError::permanent(format!("Configuration error: {}", details))
            }
        }
    }
}

/// Keyset boundary applied to a read.
#[derive(Debug, Clone, PartialEq)]
pub enum KeysetFilter {
    /// `column > value`
    After { column: String, value: Value },
    /// `column > value OR (column = value AND tie_column > tie_value)`
    AfterTie {
        column: String,
        value: Value,
        tie_column: String,
        tie_value: Value,
    },
}

/// Parameters of one source read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    /// Ascending sort columns; the last one must be unique for keysets to be stable.
    pub order_by: Vec<String>,
    pub filter: Option<KeysetFilter>,
    pub limit: usize,
}

/// Read side of a data source.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<String>, SyncError>;

    async fn count_rows(&self, table: &str) -> Result<u64, SyncError>;

    /// Rows of `table` matching the request, sorted by `order_by`.
    async fn read_rows(&self, table: &str, request: &ReadRequest) -> Result<Vec<Row>, SyncError>;

    /// Order of two key values as `read_rows` sorts and filters them.
    fn compare_keys(&self, a: &Value, b: &Value) -> Ordering {
        compare_values(a, b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    /// Replace or create the row identified by the natural key.
    Upsert,
    /// Always create a new row.
    Insert,
}

/// One resolved row to write. Fields absent from `fields` are left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub op: WriteOp,
    pub fields: Row,
}

/// Per-row outcome of a write, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowAck {
    Accepted,
    Rejected { reason: String },
}

impl RowAck {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RowAck::Accepted)
    }
}

/// Write side of a smart sheet.
#[async_trait]
pub trait SheetWriter: Send + Sync {
    /// Point-in-time read of rows whose `key_field` is one of `keys`.
    async fn find_by_keys(
        &self,
        sheet_id: &str,
        key_field: &str,
        keys: &[Value],
    ) -> Result<Vec<Row>, SyncError>;

    /// Idempotent under retry for `WriteOp::Upsert` rows with the same key.
    async fn upsert(
        &self,
        sheet_id: &str,
        rows: &[RowWrite],
        key_field: &str,
    ) -> Result<Vec<RowAck>, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
}

/// Receives terminal run outcomes. Failures never affect the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        job_name: &str,
        outcome: RunOutcome,
        details: &ExecutionLog,
    ) -> Result<(), ConnectorError>;
}

/// Notifier used when no delivery channel is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(
        &self,
        _job_name: &str,
        _outcome: RunOutcome,
        _details: &ExecutionLog,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }
}
