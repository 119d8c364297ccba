//! Migration to create the execution_logs table.
//!
//! Append-only run history. Rows are updated while a run is in flight and
//! frozen once `finalized` is set.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExecutionLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExecutionLogs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ExecutionLogs::JobId).uuid().not_null())
                    .col(ColumnDef::new(ExecutionLogs::Status).text().not_null())
                    .col(
                        ColumnDef::new(ExecutionLogs::StartTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::EndTime)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(ExecutionLogs::DurationMs).big_integer().null())
                    .col(
                        ColumnDef::new(ExecutionLogs::RecordsProcessed)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::RecordsSucceeded)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::RecordsFailed)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::RecordsSkipped)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::RetryAttempt)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::ConflictCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ExecutionLogs::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(ExecutionLogs::ValidationErrors)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ExecutionLogs::Finalized)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_execution_logs_job_id")
                            .from(ExecutionLogs::Table, ExecutionLogs::JobId)
                            .to(SyncJobs::Table, SyncJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_execution_logs_job_started")
                    .table(ExecutionLogs::Table)
                    .col(ExecutionLogs::JobId)
                    .col(ExecutionLogs::StartTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_execution_logs_job_started")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ExecutionLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExecutionLogs {
    Table,
    Id,
    JobId,
    Status,
    StartTime,
    EndTime,
    DurationMs,
    RecordsProcessed,
    RecordsSucceeded,
    RecordsFailed,
    RecordsSkipped,
    RetryAttempt,
    ConflictCount,
    ErrorMessage,
    ValidationErrors,
    Finalized,
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
}
