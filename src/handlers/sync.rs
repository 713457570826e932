//! # Sync Job Handlers
//!
//! Start, poll, cancel and retry listing sync jobs.

use axum::{
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::{ApiError, validation_error};
use crate::models::{ItemError, ItemStatus, JobState, sync_job_item};
use crate::server::AppState;
use crate::sync::{ItemInput, StartOutcome, SyncSnapshot};

/// Request body for starting a sync
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StartSyncRequest {
    /// Destination account the items are pushed to
    #[schema(example = "shop-1042")]
    pub destination_key: String,
    /// Mapped product records, pushed in this order
    pub items: Vec<ItemInput>,
}

/// Request body for re-pushing items from earlier jobs
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RetrySubsetRequest {
    #[schema(example = "shop-1042")]
    pub destination_key: String,
    /// External ids to re-push; payloads come from the latest job that had them
    #[schema(example = json!(["sku-7", "sku-9"]))]
    pub item_ids: Vec<String>,
}

/// Path parameters for job-scoped endpoints
#[derive(Debug, Deserialize, IntoParams)]
pub struct SyncJobPath {
    /// Sync job identifier (UUID)
    pub id: String,
}

/// Query parameters for the active job lookup
#[derive(Debug, Deserialize, IntoParams)]
pub struct ActiveJobQuery {
    /// Destination account key
    pub destination_key: String,
}

/// Response for the active job lookup
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ActiveJobResponse {
    pub destination_key: String,
    /// True while a job holds the key
    pub active: bool,
    /// Job currently holding the key, omitted when idle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

/// Response for a cancel request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelResponse {
    pub ok: bool,
    pub job_id: Uuid,
}

/// One item of a job with its outcome
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobItemInfo {
    pub position: i32,
    pub external_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Full per-item view of a job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobItemsResponse {
    pub job_id: Uuid,
    pub destination_key: String,
    pub state: JobState,
    pub cursor: i32,
    pub items: Vec<JobItemInfo>,
}

impl TryFrom<sync_job_item::Model> for JobItemInfo {
    type Error = crate::models::sync_job::UnknownStateError;

    fn try_from(model: sync_job_item::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            status: model.item_status()?,
            error: model.item_error(),
            position: model.position,
            external_id: model.external_id,
            attempts: model.attempts,
            processed_at: model.processed_at.map(|at| at.with_timezone(&Utc)),
        })
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        validation_error(
            "Invalid job id",
            serde_json::json!({ "id": "Must be a valid UUID" }),
        )
    })
}

/// Start a sync job, or attach to the one already running for the key
#[utoipa::path(
    post,
    path = "/sync/jobs",
    request_body = StartSyncRequest,
    responses(
        (status = 202, description = "New sync job started", body = StartOutcome),
        (status = 200, description = "A job is already running for this destination key; its id is returned", body = StartOutcome),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 503, description = "Job record store unavailable", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn start_sync(
    State(state): State<AppState>,
    payload: Result<Json<StartSyncRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartOutcome>), ApiError> {
    let Json(request) = payload?;

    let outcome = state
        .controller
        .start(&request.destination_key, request.items)
        .await?;

    let status = if outcome.already_running {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(outcome)))
}

/// Progress snapshot of a sync job
#[utoipa::path(
    get,
    path = "/sync/jobs/{id}",
    params(SyncJobPath),
    responses(
        (status = 200, description = "Current progress", body = SyncSnapshot),
        (status = 400, description = "Malformed job id", body = ApiError),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn get_progress(
    State(state): State<AppState>,
    Path(path): Path<SyncJobPath>,
) -> Result<Json<SyncSnapshot>, ApiError> {
    let job_id = parse_job_id(&path.id)?;
    Ok(Json(state.controller.progress(job_id).await?))
}

/// Every item of a sync job with its outcome
#[utoipa::path(
    get,
    path = "/sync/jobs/{id}/items",
    params(SyncJobPath),
    responses(
        (status = 200, description = "Per-item detail", body = JobItemsResponse),
        (status = 400, description = "Malformed job id", body = ApiError),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn get_job_items(
    State(state): State<AppState>,
    Path(path): Path<SyncJobPath>,
) -> Result<Json<JobItemsResponse>, ApiError> {
    let job_id = parse_job_id(&path.id)?;
    let record = state.controller.job_record(job_id).await?;

    let job_state = record.job.job_state().map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Unreadable sync job state");
        ApiError::from(crate::error::ErrorType::InternalServerError)
    })?;
    let items = record
        .items
        .into_iter()
        .map(JobItemInfo::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Unreadable sync job item status");
            ApiError::from(crate::error::ErrorType::InternalServerError)
        })?;

    Ok(Json(JobItemsResponse {
        job_id,
        destination_key: record.job.destination_key,
        state: job_state,
        cursor: record.job.cursor,
        items,
    }))
}

/// Request cancellation of a sync job
#[utoipa::path(
    post,
    path = "/sync/jobs/{id}/cancel",
    params(SyncJobPath),
    responses(
        (status = 200, description = "Cancellation requested (no-op for finished jobs)", body = CancelResponse),
        (status = 400, description = "Malformed job id", body = ApiError),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn cancel_sync(
    State(state): State<AppState>,
    Path(path): Path<SyncJobPath>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job_id = parse_job_id(&path.id)?;
    state.controller.cancel(job_id).await?;
    Ok(Json(CancelResponse { ok: true, job_id }))
}

/// Re-push selected items from earlier jobs for the same destination key
#[utoipa::path(
    post,
    path = "/sync/jobs/retry",
    request_body = RetrySubsetRequest,
    responses(
        (status = 202, description = "Retry job started", body = StartOutcome),
        (status = 200, description = "A job is already running for this destination key", body = StartOutcome),
        (status = 400, description = "Invalid request or unknown item ids", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn retry_subset(
    State(state): State<AppState>,
    payload: Result<Json<RetrySubsetRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartOutcome>), ApiError> {
    let Json(request) = payload?;

    let outcome = state
        .controller
        .retry_subset(&request.destination_key, request.item_ids)
        .await?;

    let status = if outcome.already_running {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(outcome)))
}

/// Job currently holding a destination key
#[utoipa::path(
    get,
    path = "/sync/active",
    params(ActiveJobQuery),
    responses(
        (status = 200, description = "Active job for the key, if any", body = ActiveJobResponse),
        (status = 400, description = "Missing or empty destination key", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn active_job(
    State(state): State<AppState>,
    query: Result<Query<ActiveJobQuery>, QueryRejection>,
) -> Result<Json<ActiveJobResponse>, ApiError> {
    let Query(query) = query?;
    let job_id = state.controller.active_job(&query.destination_key).await?;
    Ok(Json(ActiveJobResponse {
        destination_key: query.destination_key.trim().to_string(),
        active: job_id.is_some(),
        job_id,
    }))
}
