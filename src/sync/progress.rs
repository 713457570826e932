//! Progress snapshots served to polling clients.
//!
//! A snapshot is derived from one transactional read of the job record, so
//! its counters are always mutually consistent. Snapshots of terminal jobs
//! depend only on stored data and are identical on every poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::SyncError;
use crate::models::sync_job::UnknownStateError;
use crate::models::{ItemError, JobState};
use crate::repositories::{JobSummary, SyncJobRepository};

/// Point-in-time view of a sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncSnapshot {
    pub job_id: Uuid,
    #[schema(example = "shop-1042")]
    pub destination_key: String,
    pub state: JobState,
    /// Items submitted with the job
    pub total: u64,
    /// Items pushed successfully
    pub completed: u64,
    /// Items the destination rejected
    pub failed: u64,
    /// completed + failed
    pub processed: u64,
    /// processed / total, 0-100 with one decimal
    #[schema(example = 42.5)]
    pub percent: f64,
    /// Human-readable description of what the job is doing
    pub current_step: String,
    /// Resume time while paused on a rate limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Estimated seconds to completion, only while the job is active
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Code of the current pause or job failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    /// Failed items in position order, capped
    pub errors: Vec<SnapshotError>,
    /// True when more items failed than `errors` lists
    pub errors_truncated: bool,
}

/// One failed item as listed in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SnapshotError {
    pub position: u64,
    pub external_id: String,
    pub error: ItemError,
}

#[derive(Debug, Clone)]
pub struct ProgressPublisher {
    repo: SyncJobRepository,
    max_errors: usize,
}

impl ProgressPublisher {
    pub fn new(repo: SyncJobRepository, max_errors: usize) -> Self {
        Self { repo, max_errors }
    }

    pub async fn snapshot(&self, job_id: Uuid) -> Result<SyncSnapshot, SyncError> {
        let summary = self
            .repo
            .summarize(job_id, self.max_errors)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))?;

        build_snapshot(&summary, self.max_errors, Utc::now())
            .map_err(|e| SyncError::corrupt(job_id, e))
    }
}

/// Assemble a snapshot from a consistent read. `now` only feeds the ETA of
/// active jobs.
pub fn build_snapshot(
    summary: &JobSummary,
    max_errors: usize,
    now: DateTime<Utc>,
) -> Result<SyncSnapshot, UnknownStateError> {
    let job = &summary.job;
    let state = job.job_state()?;
    let counts = summary.counts;

    let total = job.total_items.max(0) as u64;
    let completed = counts.success;
    let failed = counts.failed;
    let processed = counts.processed();

    let percent = if total == 0 {
        if state.is_terminal() { 100.0 } else { 0.0 }
    } else {
        (processed.min(total) * 1000 / total) as f64 / 10.0
    };

    let retry_at = match state {
        JobState::PausedRateLimit => job.retry_at.map(|at| at.with_timezone(&Utc)),
        _ => None,
    };
    let started_at = job.started_at.map(|at| at.with_timezone(&Utc));

    let current_step = match state {
        JobState::Starting => "Preparing sync".to_string(),
        JobState::Running => format!(
            "Pushing item {} of {}",
            (job.cursor.max(0) as u64 + 1).min(total.max(1)),
            total
        ),
        JobState::PausedRateLimit => match retry_at {
            Some(at) => format!(
                "Rate limited by destination; resuming item {} of {} at {}",
                job.cursor + 1,
                total,
                at.to_rfc3339()
            ),
            None => format!(
                "Rate limited by destination; item {} of {} waiting",
                job.cursor + 1,
                total
            ),
        },
        JobState::Completed => format!("Completed: {} pushed, {} failed", completed, failed),
        JobState::Failed => format!(
            "Failed: {}",
            job.last_error_message.as_deref().unwrap_or("unknown error")
        ),
        JobState::Cancelled => format!("Cancelled after {} of {} items", processed, total),
    };

    let eta_seconds = if state.is_terminal() {
        None
    } else {
        estimate_remaining(started_at, retry_at, processed, total, now)
    };

    let errors = summary
        .failed_items
        .iter()
        .take(max_errors)
        .map(|item| SnapshotError {
            position: item.position.max(0) as u64,
            external_id: item.external_id.clone(),
            error: item.item_error().unwrap_or_else(|| ItemError {
                code: None,
                message: "no error detail recorded".to_string(),
                status: None,
            }),
        })
        .collect::<Vec<_>>();
    let errors_truncated = failed > errors.len() as u64;

    Ok(SyncSnapshot {
        job_id: job.id,
        destination_key: job.destination_key.clone(),
        state,
        total,
        completed,
        failed,
        processed,
        percent,
        current_step,
        retry_at,
        eta_seconds,
        parent_job_id: job.parent_job_id,
        started_at,
        finished_at: job.finished_at.map(|at| at.with_timezone(&Utc)),
        last_error_code: job.last_error_code.clone(),
        last_error_message: job.last_error_message.clone(),
        errors,
        errors_truncated,
    })
}

/// Average time per processed item times the items left, plus any
/// outstanding rate-limit wait.
fn estimate_remaining(
    started_at: Option<DateTime<Utc>>,
    retry_at: Option<DateTime<Utc>>,
    processed: u64,
    total: u64,
    now: DateTime<Utc>,
) -> Option<u64> {
    let started_at = started_at?;
    if processed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(processed);
    let elapsed_ms = (now - started_at).num_milliseconds().max(0) as f64;
    let per_item_ms = elapsed_ms / processed as f64;
    let wait_ms = retry_at
        .map(|at| (at - now).num_milliseconds().max(0) as f64)
        .unwrap_or(0.0);

    Some(((per_item_ms * remaining as f64 + wait_ms) / 1000.0).ceil() as u64)
}
