//! Migration to create the sync_cursors table.
//!
//! Holds the last acknowledged position of each job as an encoded cursor string.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncCursors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncCursors::JobId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncCursors::Position).text().not_null())
                    .col(
                        ColumnDef::new(SyncCursors::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_cursors_job_id")
                            .from(SyncCursors::Table, SyncCursors::JobId)
                            .to(SyncJobs::Table, SyncJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncCursors::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncCursors {
    Table,
    JobId,
    Position,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    Id,
}
