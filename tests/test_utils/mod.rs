//! Test utilities for database testing.
//!
//! Sets up in-memory SQLite databases with migrations applied, and builds the
//! sample jobs and collaborators shared by the integration tests.

#![allow(dead_code)]

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use sheetsync::connectors::{MemorySheet, MemorySource, NoopNotifier, Notifier};
use sheetsync::models::{
    ConflictStrategy, DataType, FieldMapping, MappingConfig, Row, SyncJob, SyncMode, SyncSettings,
};
use sheetsync::repositories::{JobStore, SeaOrmJobStore};
use sheetsync::sync_executor::{ExecutorConfig, SyncExecutor};

pub const TABLE: &str = "orders";
pub const SHEET: &str = "sheet-orders";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// In-memory job store backed by a migrated SQLite database.
pub async fn setup_store() -> Result<Arc<SeaOrmJobStore>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(SeaOrmJobStore::new(Arc::new(db))))
}

/// Build a source row from a JSON object literal.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

/// Order rows with ids `ids`, all sharing `updated_at`.
pub fn order_rows(ids: &[i64], updated_at: &str) -> Vec<Row> {
    ids.iter()
        .map(|id| {
            row(json!({
                "id": id,
                "customer": format!("customer-{id}"),
                "status": "pending",
                "amount": id * 10,
                "updated_at": updated_at,
            }))
        })
        .collect()
}

/// Mapping from the `orders` table to the orders sheet, keyed by `order_id`.
pub fn orders_mapping() -> MappingConfig {
    MappingConfig {
        source_table: TABLE.to_string(),
        target_sheet_id: SHEET.to_string(),
        key_column: "id".to_string(),
        natural_key_field: "order_id".to_string(),
        fields: vec![
            FieldMapping::new("id", "order_id")
                .with_type(DataType::Number)
                .required(),
            FieldMapping::new("customer", "customer"),
            FieldMapping::new("status", "status"),
            FieldMapping::new("amount", "amount").with_type(DataType::Number),
            FieldMapping::new("updated_at", "updated_at").with_type(DataType::Date),
        ],
    }
}

pub fn orders_job(mode: SyncMode) -> SyncJob {
    let mut sync = SyncSettings::new(mode);
    if mode == SyncMode::Incremental {
        sync.incremental_field = Some("updated_at".to_string());
    }
    let mut job = SyncJob::new("orders to sheet", "*/5 * * * *", orders_mapping(), sync);
    job.conflict.strategy = ConflictStrategy::Overwrite;
    job
}

/// Executor settings without jitter and with millisecond backoff.
pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        jitter_factor: 0.0,
        ..ExecutorConfig::default()
    }
}

/// Collaborators wired into an executor, kept for assertions.
pub struct Harness {
    pub store: Arc<SeaOrmJobStore>,
    pub source: Arc<MemorySource>,
    pub sheet: Arc<MemorySheet>,
    pub executor: Arc<SyncExecutor>,
}

pub async fn harness(rows: Vec<Row>) -> Result<Harness> {
    harness_with(rows, Arc::new(NoopNotifier), fast_config()).await
}

pub async fn harness_with(
    rows: Vec<Row>,
    notifier: Arc<dyn Notifier>,
    config: ExecutorConfig,
) -> Result<Harness> {
    let store = setup_store().await?;
    let source = Arc::new(MemorySource::new().with_table(TABLE, rows));
    let sheet = Arc::new(MemorySheet::new());
    let executor = Arc::new(SyncExecutor::new(
        source.clone(),
        sheet.clone(),
        store.clone() as Arc<dyn JobStore>,
        notifier,
        config,
    ));
    Ok(Harness {
        store,
        source,
        sheet,
        executor,
    })
}
