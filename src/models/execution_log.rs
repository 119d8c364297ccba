//! ExecutionLog entity model
//!
//! Append-only run history. A row may be updated while `finalized` is false
//! and is frozen afterwards.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "execution_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_id: Uuid,

    /// running, success or failed
    pub status: String,

    pub start_time: DateTimeWithTimeZone,

    pub end_time: Option<DateTimeWithTimeZone>,

    pub duration_ms: Option<i64>,

    pub records_processed: i64,

    pub records_succeeded: i64,

    pub records_failed: i64,

    pub records_skipped: i64,

    pub retry_attempt: i32,

    pub conflict_count: i64,

    pub error_message: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub validation_errors: Option<JsonValue>,

    pub finalized: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sync_job::Entity",
        from = "Column::JobId",
        to = "super::sync_job::Column::Id"
    )]
    SyncJob,
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
