//! Migration to create the sync_job_items table.
//!
//! Items belong to exactly one sync job; `position` is the processing order and
//! is unique within a job.

use sea_orm_migration::prelude::*;

use crate::m2026_10_01_000001_create_sync_jobs::SyncJobs;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncJobItems::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncJobItems::JobId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobItems::Position).integer().not_null())
                    .col(ColumnDef::new(SyncJobItems::ExternalId).text().not_null())
                    .col(ColumnDef::new(SyncJobItems::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncJobItems::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(SyncJobItems::Error).json_binary().null())
                    .col(
                        ColumnDef::new(SyncJobItems::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobItems::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_job_items_job_id")
                            .from(SyncJobItems::Table, SyncJobItems::JobId)
                            .to(SyncJobs::Table, SyncJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_job_items_job_position")
                    .table(SyncJobItems::Table)
                    .col(SyncJobItems::JobId)
                    .col(SyncJobItems::Position)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_job_items_external_id")
                    .table(SyncJobItems::Table)
                    .col(SyncJobItems::ExternalId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_job_items_job_position")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_job_items_external_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobItems {
    Table,
    Id,
    JobId,
    Position,
    ExternalId,
    Payload,
    Status,
    Error,
    Attempts,
    ProcessedAt,
}
