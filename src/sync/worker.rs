//! Work loop
//!
//! One task per job walks the items in order starting at the persisted
//! cursor. After every push the outcome and the new cursor are written in a
//! single transaction. A throttled push leaves the item pending, parks the job
//! in PAUSED_RATE_LIMIT until the governor's resume time and then pushes the
//! same item again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use super::governor::{PushOutcome, RateLimitGovernor};
use super::push::{ItemPusher, PushError};
use super::registry::KeyRegistry;
use super::SyncError;
use crate::models::JobState;
use crate::repositories::sync_job::item_input;
use crate::repositories::{ItemResult, StateChange, SyncJobRepository};

/// Backoff bounds for retrying the final FAILED write.
const STORE_RETRY_INITIAL: Duration = Duration::from_millis(100);
const STORE_RETRY_MAX: Duration = Duration::from_secs(5);

pub struct SyncWorker {
    repo: SyncJobRepository,
    pusher: Arc<dyn ItemPusher>,
    governor: RateLimitGovernor,
    registry: Arc<KeyRegistry>,
    push_timeout: Duration,
}

impl SyncWorker {
    pub fn new(
        repo: SyncJobRepository,
        pusher: Arc<dyn ItemPusher>,
        governor: RateLimitGovernor,
        registry: Arc<KeyRegistry>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            pusher,
            governor,
            registry,
            push_timeout,
        }
    }

    /// Run the job on its own task. The returned handle yields the final state.
    ///
    /// The loop runs inside a nested task so that a panic in a push is
    /// observed here and turned into a FAILED job; the key is released on
    /// every exit path.
    pub fn spawn(
        self: &Arc<Self>,
        job_id: Uuid,
        destination_key: String,
        cancel: CancellationToken,
    ) -> JoinHandle<JobState> {
        let span = tracing::info_span!("sync_job", job_id = %job_id, destination_key = %destination_key);
        let worker = Arc::clone(self);

        tokio::spawn(
            async move {
                let inner = {
                    let worker = Arc::clone(&worker);
                    tokio::spawn(
                        async move { worker.drive(job_id, &cancel).await }
                            .instrument(tracing::Span::current()),
                    )
                };

                let outcome = match inner.await {
                    Ok(outcome) => outcome,
                    Err(join_error) => Err(SyncError::WorkerAborted(join_error.to_string())),
                };

                worker.finish(job_id, &destination_key, outcome).await
            }
            .instrument(span),
        )
    }

    async fn finish(
        &self,
        job_id: Uuid,
        destination_key: &str,
        outcome: Result<JobState, SyncError>,
    ) -> JobState {
        let state = match outcome {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "Sync job failed");
                let change = StateChange::Failed {
                    code: err.code().to_string(),
                    message: err.to_string(),
                };
                if self.persist_failure(job_id, &change).await {
                    JobState::Failed
                } else {
                    self.stored_state(job_id)
                        .await
                        .unwrap_or(JobState::Failed)
                }
            }
        };

        self.registry.release(destination_key, job_id);
        counter!("sync_jobs_finished_total", "state" => state.as_str()).increment(1);
        info!(state = %state, "Sync job finished");
        state
    }

    /// Write FAILED, retrying while the store rejects the write. The key
    /// stays reserved until it lands so no start attaches to a loop-less row.
    async fn persist_failure(&self, job_id: Uuid, change: &StateChange) -> bool {
        let mut delay = STORE_RETRY_INITIAL;
        let mut attempt: u32 = 1;
        loop {
            match self.repo.set_state(job_id, change).await {
                Ok(changed) => return changed,
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to persist FAILED state, retrying"
                    );
                    counter!("sync_store_write_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(STORE_RETRY_MAX);
                    attempt += 1;
                }
            }
        }
    }

    async fn drive(&self, job_id: Uuid, cancel: &CancellationToken) -> Result<JobState, SyncError> {
        let job = self
            .repo
            .find_job(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))?;
        let state = job
            .job_state()
            .map_err(|e| SyncError::corrupt(job_id, e))?;

        if state.is_terminal() {
            return Ok(state);
        }

        let mut cursor = job.cursor;
        let mut pauses = job.attempt_count.max(0) as u32;

        if state == JobState::PausedRateLimit {
            let retry_at = job
                .retry_at
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            info!(retry_at = %retry_at, "Resuming paused sync job");
            if !wait_until(retry_at, cancel).await {
                return self.cancel_job(job_id).await;
            }
        }

        if !self.repo.set_state(job_id, &StateChange::Running).await? {
            return self.observed_state(job_id).await;
        }
        info!(total = job.total_items, cursor, "Sync job running");

        loop {
            if cancel.is_cancelled() {
                return self.cancel_job(job_id).await;
            }

            if cursor >= job.total_items {
                if self.repo.set_state(job_id, &StateChange::Completed).await? {
                    return Ok(JobState::Completed);
                }
                return self.observed_state(job_id).await;
            }

            let item = self
                .repo
                .item_at(job_id, cursor)
                .await?
                .ok_or_else(|| SyncError::CorruptRecord {
                    job_id,
                    detail: format!("item at position {} is missing", cursor),
                })?;
            let attempts = item.attempts + 1;
            let input = item_input(&item);

            // In-flight pushes are never interrupted; cancellation is checked
            // between items.
            let started = Instant::now();
            let result = match tokio::time::timeout(
                self.push_timeout,
                self.pusher.push(&job.destination_key, &input),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PushError::Network {
                    details: format!("push timed out after {:?}", self.push_timeout),
                    timed_out: true,
                }),
            };
            histogram!("sync_push_duration_seconds").record(started.elapsed().as_secs_f64());

            match self.governor.classify(&result) {
                PushOutcome::Ok => {
                    if let Some(state) = self
                        .record(job_id, cursor, ItemResult::Success, attempts)
                        .await?
                    {
                        return Ok(state);
                    }
                    counter!("sync_items_pushed_total").increment(1);
                    debug!(position = cursor, external_id = %item.external_id, "Item pushed");
                    cursor += 1;
                    pauses = 0;
                }
                PushOutcome::HardFailure(item_error) => {
                    warn!(
                        position = cursor,
                        external_id = %item.external_id,
                        error = %item_error,
                        "Item rejected by destination"
                    );
                    if let Some(state) = self
                        .record(job_id, cursor, ItemResult::Failed(item_error), attempts)
                        .await?
                    {
                        return Ok(state);
                    }
                    counter!("sync_items_failed_total").increment(1);
                    cursor += 1;
                    pauses = 0;
                }
                PushOutcome::RateLimited {
                    retry_after_secs,
                    code,
                    message,
                } => {
                    counter!("sync_rate_limited_total").increment(1);
                    self.repo.record_attempt(job_id, cursor, attempts).await?;

                    let (retry_at, delay) =
                        self.governor
                            .retry_at(Utc::now(), retry_after_secs, pauses);
                    pauses += 1;
                    histogram!("sync_rate_limit_wait_seconds").record(delay.as_secs_f64());
                    warn!(
                        position = cursor,
                        external_id = %item.external_id,
                        retry_after_secs = ?retry_after_secs,
                        wait_secs = delay.as_secs_f64(),
                        pauses,
                        "Destination rate limited push; pausing"
                    );

                    let paused = StateChange::PausedRateLimit {
                        retry_at,
                        pauses: pauses as i32,
                        code,
                        message,
                    };
                    if !self.repo.set_state(job_id, &paused).await? {
                        return self.observed_state(job_id).await;
                    }

                    if !wait_until(retry_at, cancel).await {
                        return self.cancel_job(job_id).await;
                    }

                    if !self.repo.set_state(job_id, &StateChange::Running).await? {
                        return self.observed_state(job_id).await;
                    }
                    debug!(position = cursor, "Resuming after rate limit");
                }
            }
        }
    }

    /// Write the item outcome. `Some(state)` means the job was finished
    /// elsewhere and the loop must stop.
    async fn record(
        &self,
        job_id: Uuid,
        position: i32,
        result: ItemResult,
        attempts: i32,
    ) -> Result<Option<JobState>, SyncError> {
        if self
            .repo
            .record_item(job_id, position, &result, attempts)
            .await?
        {
            Ok(None)
        } else {
            self.observed_state(job_id).await.map(Some)
        }
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<JobState, SyncError> {
        info!("Sync job cancelled");
        if self.repo.set_state(job_id, &StateChange::Cancelled).await? {
            Ok(JobState::Cancelled)
        } else {
            self.observed_state(job_id).await
        }
    }

    /// A conditional write matched nothing. That is expected only when the
    /// job was already finished by someone else.
    async fn observed_state(&self, job_id: Uuid) -> Result<JobState, SyncError> {
        match self.stored_state(job_id).await {
            Some(state) if state.is_terminal() => {
                info!(state = %state, "Sync job finished elsewhere; stopping");
                Ok(state)
            }
            Some(state) => Err(SyncError::CorruptRecord {
                job_id,
                detail: format!("conditional update rejected while job is {}", state),
            }),
            None => Err(SyncError::JobNotFound(job_id)),
        }
    }

    async fn stored_state(&self, job_id: Uuid) -> Option<JobState> {
        self.repo
            .find_job(job_id)
            .await
            .ok()
            .flatten()
            .and_then(|job| job.job_state().ok())
    }
}

/// Sleep until `retry_at`. Returns false if cancelled first.
async fn wait_until(retry_at: DateTime<Utc>, cancel: &CancellationToken) -> bool {
    let delay = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
