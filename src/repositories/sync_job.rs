//! # SyncJob Repository
//!
//! Durable job records: one `sync_jobs` row per run plus one `sync_job_items`
//! row per submitted record. Every write the work loop issues is conditional
//! so an item can only be recorded once and terminal jobs never change.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Func, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::models::sync_job::{self, JobState};
use crate::models::sync_job_item::{self, ItemError, ItemStatus};
use crate::sync::ItemInput;

/// Rows per multi-row insert when persisting items.
const ITEM_INSERT_CHUNK: usize = 500;

/// A job together with its items, ordered by position.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job: sync_job::Model,
    pub items: Vec<sync_job_item::Model>,
}

/// Item totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemCounts {
    pub pending: u64,
    pub success: u64,
    pub failed: u64,
}

impl ItemCounts {
    pub fn processed(&self) -> u64 {
        self.success + self.failed
    }
}

/// Job row, item totals and the earliest failures, read in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub job: sync_job::Model,
    pub counts: ItemCounts,
    pub failed_items: Vec<sync_job_item::Model>,
}

/// Final outcome of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    Success,
    Failed(ItemError),
}

/// A state transition with the fields it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Running,
    PausedRateLimit {
        retry_at: DateTime<Utc>,
        pauses: i32,
        code: String,
        message: String,
    },
    Completed,
    Cancelled,
    Failed {
        code: String,
        message: String,
    },
}

impl StateChange {
    pub fn target(&self) -> JobState {
        match self {
            StateChange::Running => JobState::Running,
            StateChange::PausedRateLimit { .. } => JobState::PausedRateLimit,
            StateChange::Completed => JobState::Completed,
            StateChange::Cancelled => JobState::Cancelled,
            StateChange::Failed { .. } => JobState::Failed,
        }
    }
}

/// Repository for sync job database operations
#[derive(Debug, Clone)]
pub struct SyncJobRepository {
    db: DatabaseConnection,
}

impl SyncJobRepository {
    /// Create a new SyncJobRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Persist a new job in STARTING with all of its items pending.
    ///
    /// Fails with a unique violation when another active job already owns
    /// `destination_key`.
    pub async fn create(
        &self,
        job_id: Uuid,
        destination_key: &str,
        items: &[ItemInput],
        parent_job_id: Option<Uuid>,
    ) -> Result<sync_job::Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let job = sync_job::ActiveModel {
            id: Set(job_id),
            destination_key: Set(destination_key.to_string()),
            state: Set(JobState::Starting.as_str().to_string()),
            total_items: Set(items.len() as i32),
            cursor: Set(0),
            attempt_count: Set(0),
            last_error_code: Set(None),
            last_error_message: Set(None),
            retry_at: Set(None),
            parent_job_id: Set(parent_job_id),
            started_at: Set(None),
            finished_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        for (chunk_index, chunk) in items.chunks(ITEM_INSERT_CHUNK).enumerate() {
            let offset = chunk_index * ITEM_INSERT_CHUNK;
            let rows = chunk
                .iter()
                .enumerate()
                .map(|(i, item)| sync_job_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    job_id: Set(job_id),
                    position: Set((offset + i) as i32),
                    external_id: Set(item.external_id.clone()),
                    payload: Set(item.payload.clone()),
                    status: Set(ItemStatus::Pending.as_str().to_string()),
                    error: Set(None),
                    attempts: Set(0),
                    processed_at: Set(None),
                });
            sync_job_item::Entity::insert_many(rows).exec(&txn).await?;
        }

        txn.commit().await?;

        tracing::info!(
            job_id = %job_id,
            destination_key = %destination_key,
            total_items = items.len(),
            parent_job_id = ?parent_job_id,
            "Sync job created"
        );

        Ok(job)
    }

    pub async fn find_job(&self, job_id: Uuid) -> Result<Option<sync_job::Model>, DbErr> {
        sync_job::Entity::find_by_id(job_id).one(&self.db).await
    }

    /// Full record with items in position order.
    pub async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, DbErr> {
        let txn = self.db.begin().await?;
        let Some(job) = sync_job::Entity::find_by_id(job_id).one(&txn).await? else {
            txn.commit().await?;
            return Ok(None);
        };
        let items = sync_job_item::Entity::find()
            .filter(sync_job_item::Column::JobId.eq(job_id))
            .order_by_asc(sync_job_item::Column::Position)
            .all(&txn)
            .await?;
        txn.commit().await?;
        Ok(Some(JobRecord { job, items }))
    }

    pub async fn item_at(
        &self,
        job_id: Uuid,
        position: i32,
    ) -> Result<Option<sync_job_item::Model>, DbErr> {
        sync_job_item::Entity::find()
            .filter(sync_job_item::Column::JobId.eq(job_id))
            .filter(sync_job_item::Column::Position.eq(position))
            .one(&self.db)
            .await
    }

    /// Record the final outcome of the item at `position` and advance the
    /// cursor past it, atomically.
    ///
    /// Returns false (and writes nothing) unless the job is RUNNING with its
    /// cursor at `position` and the item is still pending.
    pub async fn record_item(
        &self,
        job_id: Uuid,
        position: i32,
        result: &ItemResult,
        attempts: i32,
    ) -> Result<bool, DbErr> {
        let now = Utc::now().fixed_offset();
        let (status, error) = match result {
            ItemResult::Success => (ItemStatus::Success, None),
            ItemResult::Failed(error) => (
                ItemStatus::Failed,
                Some(serde_json::to_value(error).map_err(|e| DbErr::Json(e.to_string()))?),
            ),
        };

        let txn = self.db.begin().await?;

        let advanced = sync_job::Entity::update_many()
            .col_expr(sync_job::Column::Cursor, Expr::value(position + 1))
            .col_expr(sync_job::Column::AttemptCount, Expr::value(0))
            .col_expr(
                sync_job::Column::LastErrorCode,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                sync_job::Column::LastErrorMessage,
                Expr::value(Option::<String>::None),
            )
            .col_expr(sync_job::Column::UpdatedAt, Expr::value(now))
            .filter(sync_job::Column::Id.eq(job_id))
            .filter(sync_job::Column::Cursor.eq(position))
            .filter(sync_job::Column::State.eq(JobState::Running.as_str()))
            .exec(&txn)
            .await?;
        if advanced.rows_affected != 1 {
            txn.rollback().await?;
            return Ok(false);
        }

        let recorded = sync_job_item::Entity::update_many()
            .col_expr(sync_job_item::Column::Status, Expr::value(status.as_str()))
            .col_expr(sync_job_item::Column::Error, Expr::value(error))
            .col_expr(sync_job_item::Column::Attempts, Expr::value(attempts))
            .col_expr(sync_job_item::Column::ProcessedAt, Expr::value(Some(now)))
            .filter(sync_job_item::Column::JobId.eq(job_id))
            .filter(sync_job_item::Column::Position.eq(position))
            .filter(sync_job_item::Column::Status.eq(ItemStatus::Pending.as_str()))
            .exec(&txn)
            .await?;
        if recorded.rows_affected != 1 {
            txn.rollback().await?;
            return Ok(false);
        }

        txn.commit().await?;
        Ok(true)
    }

    /// Persist the attempt count of a throttled push; the item stays pending.
    pub async fn record_attempt(
        &self,
        job_id: Uuid,
        position: i32,
        attempts: i32,
    ) -> Result<(), DbErr> {
        sync_job_item::Entity::update_many()
            .col_expr(sync_job_item::Column::Attempts, Expr::value(attempts))
            .filter(sync_job_item::Column::JobId.eq(job_id))
            .filter(sync_job_item::Column::Position.eq(position))
            .filter(sync_job_item::Column::Status.eq(ItemStatus::Pending.as_str()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Apply a state transition unless the job is already terminal.
    ///
    /// COMPLETED additionally requires every item to be processed. Returns
    /// whether the row changed.
    pub async fn set_state(&self, job_id: Uuid, change: &StateChange) -> Result<bool, DbErr> {
        let now = Utc::now().fixed_offset();
        let no_retry = Expr::value(Option::<sea_orm::prelude::DateTimeWithTimeZone>::None);

        let mut update = sync_job::Entity::update_many()
            .col_expr(
                sync_job::Column::State,
                Expr::value(change.target().as_str()),
            )
            .col_expr(sync_job::Column::UpdatedAt, Expr::value(now))
            .filter(sync_job::Column::Id.eq(job_id))
            .filter(sync_job::Column::State.is_in(JobState::active_values()));

        update = match change {
            StateChange::Running => update
                .col_expr(sync_job::Column::RetryAt, no_retry)
                .col_expr(
                    sync_job::Column::StartedAt,
                    SimpleExpr::from(Func::coalesce([
                        SimpleExpr::from(Expr::col(sync_job::Column::StartedAt)),
                        Expr::value(now),
                    ])),
                ),
            StateChange::PausedRateLimit {
                retry_at,
                pauses,
                code,
                message,
            } => update
                .col_expr(
                    sync_job::Column::RetryAt,
                    Expr::value(Some(retry_at.fixed_offset())),
                )
                .col_expr(sync_job::Column::AttemptCount, Expr::value(*pauses))
                .col_expr(sync_job::Column::LastErrorCode, Expr::value(code.clone()))
                .col_expr(
                    sync_job::Column::LastErrorMessage,
                    Expr::value(message.clone()),
                ),
            StateChange::Completed => update
                .col_expr(sync_job::Column::RetryAt, no_retry)
                .col_expr(sync_job::Column::FinishedAt, Expr::value(Some(now)))
                .filter(
                    Expr::col(sync_job::Column::Cursor).eq(Expr::col(sync_job::Column::TotalItems)),
                ),
            StateChange::Cancelled => update
                .col_expr(sync_job::Column::RetryAt, no_retry)
                .col_expr(sync_job::Column::FinishedAt, Expr::value(Some(now))),
            StateChange::Failed { code, message } => update
                .col_expr(sync_job::Column::RetryAt, no_retry)
                .col_expr(sync_job::Column::FinishedAt, Expr::value(Some(now)))
                .col_expr(sync_job::Column::LastErrorCode, Expr::value(code.clone()))
                .col_expr(
                    sync_job::Column::LastErrorMessage,
                    Expr::value(message.clone()),
                ),
        };

        let result = update.exec(&self.db).await?;
        if result.rows_affected == 1 {
            tracing::debug!(job_id = %job_id, state = %change.target(), "Sync job state changed");
        }
        Ok(result.rows_affected == 1)
    }

    /// The non-terminal job holding `destination_key`, if any.
    pub async fn find_active_by_key(
        &self,
        destination_key: &str,
    ) -> Result<Option<sync_job::Model>, DbErr> {
        sync_job::Entity::find()
            .filter(sync_job::Column::DestinationKey.eq(destination_key))
            .filter(sync_job::Column::State.is_in(JobState::active_values()))
            .order_by_desc(sync_job::Column::CreatedAt)
            .one(&self.db)
            .await
    }

    /// All non-terminal jobs, oldest first.
    pub async fn list_active(&self) -> Result<Vec<sync_job::Model>, DbErr> {
        sync_job::Entity::find()
            .filter(sync_job::Column::State.is_in(JobState::active_values()))
            .order_by_asc(sync_job::Column::CreatedAt)
            .all(&self.db)
            .await
    }

    /// Job row, status totals and the first `error_limit` failed items.
    pub async fn summarize(
        &self,
        job_id: Uuid,
        error_limit: usize,
    ) -> Result<Option<JobSummary>, DbErr> {
        let txn = self.db.begin().await?;
        let Some(job) = sync_job::Entity::find_by_id(job_id).one(&txn).await? else {
            txn.commit().await?;
            return Ok(None);
        };

        let rows = sync_job_item::Entity::find()
            .select_only()
            .column(sync_job_item::Column::Status)
            .column_as(Expr::col(sync_job_item::Column::Id).count(), "count")
            .filter(sync_job_item::Column::JobId.eq(job_id))
            .group_by(sync_job_item::Column::Status)
            .into_tuple::<(String, i64)>()
            .all(&txn)
            .await?;

        let mut counts = ItemCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.parse::<ItemStatus>() {
                Ok(ItemStatus::Pending) => counts.pending += count,
                Ok(ItemStatus::Success) => counts.success += count,
                Ok(ItemStatus::Failed) => counts.failed += count,
                Err(e) => {
                    txn.rollback().await?;
                    return Err(DbErr::Type(format!("sync job item status: {}", e)));
                }
            }
        }

        let failed_items = sync_job_item::Entity::find()
            .filter(sync_job_item::Column::JobId.eq(job_id))
            .filter(sync_job_item::Column::Status.eq(ItemStatus::Failed.as_str()))
            .order_by_asc(sync_job_item::Column::Position)
            .limit(error_limit as u64)
            .all(&txn)
            .await?;

        txn.commit().await?;
        Ok(Some(JobSummary {
            job,
            counts,
            failed_items,
        }))
    }

    /// For each external id, the item from the most recent job for
    /// `destination_key` that contains it. Ids never seen are omitted.
    pub async fn latest_items_for_key(
        &self,
        destination_key: &str,
        external_ids: &[String],
    ) -> Result<Vec<sync_job_item::Model>, DbErr> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = sync_job_item::Entity::find()
            .inner_join(sync_job::Entity)
            .filter(sync_job::Column::DestinationKey.eq(destination_key))
            .filter(sync_job_item::Column::ExternalId.is_in(external_ids.iter().cloned()))
            .order_by_desc(sync_job::Column::CreatedAt)
            .order_by_desc(sync_job_item::Column::Position)
            .all(&self.db)
            .await?;

        let mut seen = std::collections::HashSet::new();
        Ok(candidates
            .into_iter()
            .filter(|item| seen.insert(item.external_id.clone()))
            .collect())
    }
}

/// Payload of an item as it will be re-submitted.
pub fn item_input(item: &sync_job_item::Model) -> ItemInput {
    ItemInput {
        external_id: item.external_id.clone(),
        payload: item.payload.clone(),
    }
}
