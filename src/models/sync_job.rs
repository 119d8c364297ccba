//! SyncJob entity model
//!
//! SeaORM entity for the sync_jobs table. Mapping, sync and conflict settings
//! are stored as JSON documents; run state lives in plain columns so the
//! scheduler can read it cheaply.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    /// Five-field cron expression
    pub schedule: String,

    /// full, incremental or paged
    pub sync_mode: String,

    pub enabled: bool,

    #[sea_orm(column_type = "JsonBinary")]
    pub mapping: JsonValue,

    #[sea_orm(column_type = "JsonBinary")]
    pub sync_settings: JsonValue,

    #[sea_orm(column_type = "JsonBinary")]
    pub conflict_settings: JsonValue,

    pub max_retries: i32,

    /// Consecutive failed runs
    pub retry_count: i32,

    /// idle, running, success, failed, paused or resuming
    pub status: String,

    pub last_run: Option<DateTimeWithTimeZone>,

    pub next_run: Option<DateTimeWithTimeZone>,

    pub last_error: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::sync_cursor::Entity")]
    Cursor,
    #[sea_orm(has_many = "super::execution_log::Entity")]
    ExecutionLogs,
}

impl Related<super::sync_cursor::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Cursor.def()
    }
}

impl Related<super::execution_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExecutionLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
