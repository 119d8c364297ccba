//! Sync job definitions.
//!
//! A [`SyncJob`] describes where rows come from, where they go, how each column
//! maps onto a target field, how progress is tracked and how conflicts with
//! existing target rows are settled. Definitions are validated with
//! [`SyncJob::validate`] before they are persisted.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::conflict::MergeExpr;
use crate::cron::CronSchedule;
use crate::error::ConfigurationError;

pub const DEFAULT_PAGE_SIZE: u32 = 500;
pub const MAX_PAGE_SIZE: u32 = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// How a job enumerates the source table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
    Paged,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
            SyncMode::Paged => "paged",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            "paged" => Ok(SyncMode::Paged),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

/// Kind of value held by the incremental field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalType {
    #[default]
    Timestamp,
    Id,
    Custom,
}

/// Lifecycle state of a job as last persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
    Paused,
    Resuming,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
            JobStatus::Resuming => "resuming",
        }
    }

    /// Running or resuming.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Resuming)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobStatus::Idle),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "paused" => Ok(JobStatus::Paused),
            "resuming" => Ok(JobStatus::Resuming),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Declared type of a target field; source values are coerced to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    String,
    Number,
    Date,
    Boolean,
    Json,
}

/// Row-level conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    Overwrite,
    Append,
    Ignore,
    Merge,
    Skip,
    Error,
}

/// Field-level conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldConflictStrategy {
    Overwrite,
    Preserve,
    Merge,
    Skip,
}

/// Closed set of value transforms applied before type coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Uppercase,
    Lowercase,
    Abs,
    Round,
    DateOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

/// A single check run against a resolved field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Required,
    MinLength { value: usize },
    MaxLength { value: usize },
    Min { value: f64 },
    Max { value: f64 },
    Pattern { value: String },
    OneOf { values: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub rule: RuleKind,
    #[serde(default)]
    pub severity: Severity,
    /// Overrides the generated message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One source column to target field rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_column: String,
    pub target_field: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_strategy: Option<FieldConflictStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_expression: Option<MergeExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationRule>,
}

impl FieldMapping {
    pub fn new(source_column: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_column: source_column.into(),
            target_field: target_field.into(),
            data_type: DataType::String,
            transform: None,
            default_value: None,
            conflict_strategy: None,
            merge_expression: None,
            validation: Vec::new(),
        }
    }

    pub fn with_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_rule(mut self, rule: RuleKind, severity: Severity) -> Self {
        self.validation.push(ValidationRule {
            rule,
            severity,
            message: None,
        });
        self
    }

    pub fn required(self) -> Self {
        self.with_rule(RuleKind::Required, Severity::Error)
    }

    /// A field is required when it carries an error-severity `required` rule.
    pub fn is_required(&self) -> bool {
        self.validation
            .iter()
            .any(|r| r.rule == RuleKind::Required && r.severity == Severity::Error)
    }
}

/// Source table, target sheet and the column mapping between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub source_table: String,
    pub target_sheet_id: String,
    /// Stable source key used for ordering and tie-breaking.
    pub key_column: String,
    /// Target field the sheet upserts on; must be one of the mapped fields.
    pub natural_key_field: String,
    pub fields: Vec<FieldMapping>,
}

impl MappingConfig {
    pub fn field(&self, target_field: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.target_field == target_field)
    }

    /// Source column feeding the natural key field.
    pub fn natural_key_column(&self) -> Option<&str> {
        self.field(&self.natural_key_field)
            .map(|f| f.source_column.as_str())
    }
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_enable_resume() -> bool {
    true
}

/// Mode-specific progress parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub mode: SyncMode,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_enable_resume")]
    pub enable_resume: bool,
    /// Caps rows per run for paged and incremental modes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records_per_sync: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_type: Option<IncrementalType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_timeout_seconds: Option<u64>,
}

impl SyncSettings {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            page_size: DEFAULT_PAGE_SIZE,
            enable_resume: true,
            max_records_per_sync: None,
            incremental_type: None,
            incremental_field: None,
            sync_timeout_seconds: None,
        }
    }
}

/// Per-field override of the row-level conflict strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOverride {
    pub target_field: String,
    pub strategy: FieldConflictStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_expression: Option<MergeExpr>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConflictSettings {
    #[serde(default)]
    pub strategy: ConflictStrategy,
    /// Ordered; the first override for a field wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_overrides: Vec<FieldOverride>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_enabled() -> bool {
    true
}

/// Durable job definition plus the run state maintained by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    /// Five-field cron expression.
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub mapping: MappingConfig,
    pub sync: SyncSettings,
    #[serde(default)]
    pub conflict: ConflictSettings,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Consecutive failed runs.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncJob {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        mapping: MappingConfig,
        sync: SyncSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schedule: schedule.into(),
            enabled: true,
            mapping,
            sync,
            conflict: ConflictSettings::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            status: JobStatus::Idle,
            last_run: None,
            next_run: None,
            last_error: None,
        }
    }

    /// Parsed schedule. Only fails for definitions that bypassed validation.
    pub fn cron(&self) -> Result<CronSchedule, ConfigurationError> {
        CronSchedule::parse(&self.schedule).map_err(|e| ConfigurationError::InvalidCron {
            expression: self.schedule.clone(),
            reason: e.to_string(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.sync.page_size.clamp(1, MAX_PAGE_SIZE) as usize
    }

    pub fn sync_timeout(&self, default: Duration) -> Duration {
        self.sync
            .sync_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Field overrides in evaluation order: explicit overrides first, then
    /// strategies declared on the mappings themselves.
    pub fn field_overrides(&self) -> Vec<FieldOverride> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for o in &self.conflict.field_overrides {
            if seen.insert(o.target_field.clone()) {
                out.push(o.clone());
            }
        }
        for f in &self.mapping.fields {
            if let Some(strategy) = f.conflict_strategy
                && seen.insert(f.target_field.clone())
            {
                out.push(FieldOverride {
                    target_field: f.target_field.clone(),
                    strategy,
                    merge_expression: f.merge_expression.clone(),
                });
            }
        }
        out
    }

    /// Reject definitions that must never reach the executor.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::MissingName);
        }

        self.cron()?;

        if self.mapping.source_table.trim().is_empty() {
            return Err(ConfigurationError::MissingSourceTable);
        }
        if self.mapping.target_sheet_id.trim().is_empty() {
            return Err(ConfigurationError::MissingTargetSheet);
        }
        if self.mapping.key_column.trim().is_empty() {
            return Err(ConfigurationError::MissingKeyColumn);
        }
        if self.mapping.fields.is_empty() {
            return Err(ConfigurationError::EmptyMapping);
        }

        let mut targets = HashSet::new();
        for field in &self.mapping.fields {
            if field.source_column.trim().is_empty() || field.target_field.trim().is_empty() {
                return Err(ConfigurationError::BlankMappingColumn);
            }
            if !targets.insert(field.target_field.as_str()) {
                return Err(ConfigurationError::DuplicateTargetField {
                    field: field.target_field.clone(),
                });
            }
            for rule in &field.validation {
                if let RuleKind::Pattern { value } = &rule.rule {
                    regex::Regex::new(value).map_err(|e| ConfigurationError::InvalidPattern {
                        field: field.target_field.clone(),
                        pattern: value.clone(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }

        if !targets.contains(self.mapping.natural_key_field.as_str()) {
            return Err(ConfigurationError::UnknownNaturalKey {
                field: self.mapping.natural_key_field.clone(),
            });
        }

        for o in &self.conflict.field_overrides {
            if !targets.contains(o.target_field.as_str()) {
                return Err(ConfigurationError::UnknownOverrideField {
                    field: o.target_field.clone(),
                });
            }
        }

        if self.sync.page_size == 0 || self.sync.page_size > MAX_PAGE_SIZE {
            return Err(ConfigurationError::InvalidPageSize {
                value: self.sync.page_size,
                max: MAX_PAGE_SIZE,
            });
        }

        if self.sync.max_records_per_sync == Some(0) {
            return Err(ConfigurationError::InvalidMaxRecords);
        }

        if self.sync.sync_timeout_seconds == Some(0) {
            return Err(ConfigurationError::InvalidSyncTimeout);
        }

        if self.sync.mode == SyncMode::Incremental
            && self
                .sync
                .incremental_field
                .as_deref()
                .is_none_or(|f| f.trim().is_empty())
        {
            return Err(ConfigurationError::MissingIncrementalField);
        }

        Ok(())
    }
}
