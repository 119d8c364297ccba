//! # Data Models
//!
//! Domain types for job definitions and execution history, plus the SeaORM
//! entities they are persisted through.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod execution;
pub mod execution_log;
pub mod job;
pub mod sync_cursor;
pub mod sync_job;
pub mod value;

pub use execution::{ExecutionLog, RunStatus, ValidationError};
pub use job::{
    ConflictSettings, ConflictStrategy, DataType, FieldConflictStrategy, FieldMapping,
    FieldOverride, IncrementalType, JobStatus, MappingConfig, RuleKind, Severity, SyncJob,
    SyncMode, SyncSettings, Transform, ValidationRule,
};
pub use value::Row;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "sheetsync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
