use thiserror::Error;
use uuid::Uuid;

use crate::models::sync_job::UnknownStateError;

/// Errors surfaced by the sync engine.
///
/// Item-level push failures never appear here: they are recorded on the item
/// and the job carries on.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync job {0} not found")]
    JobNotFound(Uuid),

    #[error("invalid {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("no previous sync for '{key}' contains items {item_ids:?}")]
    UnknownItems { key: String, item_ids: Vec<String> },

    #[error("job record store error: {0}")]
    Store(#[from] sea_orm::DbErr),

    #[error("sync job {job_id} record is inconsistent: {detail}")]
    CorruptRecord { job_id: Uuid, detail: String },

    #[error("work loop aborted: {0}")]
    WorkerAborted(String),
}

impl SyncError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SyncError::InvalidRequest {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(job_id: Uuid, error: UnknownStateError) -> Self {
        SyncError::CorruptRecord {
            job_id,
            detail: error.to_string(),
        }
    }

    /// Stable code recorded as `last_error_code` when this error fails a job.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::JobNotFound(_) => "JOB_NOT_FOUND",
            SyncError::InvalidRequest { .. } | SyncError::UnknownItems { .. } => {
                "INVALID_REQUEST"
            }
            SyncError::Store(_) => "STORE_UNAVAILABLE",
            SyncError::CorruptRecord { .. } => "CORRUPT_RECORD",
            SyncError::WorkerAborted(_) => "WORKER_ABORTED",
        }
    }
}
