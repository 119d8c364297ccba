//! Database migrations for the sheetsync engine.
//!
//! Schema for job definitions, per-job cursors and execution history, applied
//! through SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000100_create_sync_jobs;
mod m2025_12_01_000200_create_sync_cursors;
mod m2025_12_01_000300_create_execution_logs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_000100_create_sync_jobs::Migration),
            Box::new(m2025_12_01_000200_create_sync_cursors::Migration),
            Box::new(m2025_12_01_000300_create_execution_logs::Migration),
        ]
    }
}
