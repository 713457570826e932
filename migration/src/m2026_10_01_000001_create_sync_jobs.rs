//! Migration to create the sync_jobs table.
//!
//! One row per sync run against a destination account, holding the job state
//! machine, the item cursor and the diagnostics of the current pause or failure.

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
                    .col(ColumnDef::new(SyncJobs::DestinationKey).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::State)
                            .text()
                            .not_null()
                            .default("starting"),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::TotalItems)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::Cursor)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncJobs::LastErrorCode).text().null())
                    .col(ColumnDef::new(SyncJobs::LastErrorMessage).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::RetryAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncJobs::ParentJobId).uuid().null())
                    .col(
                        ColumnDef::new(SyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
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

        // Lookup of the latest jobs for a destination account
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_destination_key_created")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::DestinationKey)
                    .col(SyncJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        // Startup recovery scans non-terminal jobs
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_state")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::State)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_jobs_destination_key_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_sync_jobs_state").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum SyncJobs {
    Table,
    Id,
    DestinationKey,
    State,
    TotalItems,
    Cursor,
    AttemptCount,
    LastErrorCode,
    LastErrorMessage,
    RetryAt,
    ParentJobId,
    StartedAt,
    FinishedAt,
    CreatedAt,
    UpdatedAt,
}
