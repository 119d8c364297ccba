//! Migration to create the sync_jobs table.
//!
//! One row per durable job definition: schedule, sync mode, the JSON encoded
//! mapping/sync/conflict settings and the run state maintained by the engine.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncJobs::Name).text().not_null())
                    .col(ColumnDef::new(SyncJobs::Schedule).text().not_null())
                    .col(ColumnDef::new(SyncJobs::SyncMode).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(SyncJobs::Mapping).json_binary().not_null())
                    .col(ColumnDef::new(SyncJobs::SyncSettings).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::ConflictSettings)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::Status)
                            .text()
                            .not_null()
                            .default("idle"),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::LastRun)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::NextRun)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncJobs::LastError).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Scheduler loads enabled jobs on initialize/reload
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_enabled")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::Enabled)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_jobs_enabled").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
    Name,
    Schedule,
    SyncMode,
    Enabled,
    Mapping,
    SyncSettings,
    ConflictSettings,
    MaxRetries,
    RetryCount,
    Status,
    LastRun,
    NextRun,
    LastError,
    CreatedAt,
    UpdatedAt,
}
