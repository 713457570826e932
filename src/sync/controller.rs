//! Job controller
//!
//! The boundary the HTTP layer talks to. Validates requests, enforces one
//! active job per destination key and hands new jobs to the work loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::governor::RateLimitGovernor;
use super::progress::{ProgressPublisher, SyncSnapshot};
use super::push::{ItemInput, ItemPusher};
use super::registry::{KeyRegistry, ReservationGuard};
use super::worker::SyncWorker;
use super::SyncError;
use crate::config::{ConfigError, RateLimitPolicyConfig, RestartPolicy, SyncEngineConfig};
use crate::error::is_unique_violation;
use crate::models::JobState;
use crate::repositories::sync_job::item_input;
use crate::repositories::{JobRecord, StateChange, SyncJobRepository};

/// Longest accepted destination key.
const MAX_DESTINATION_KEY_LEN: usize = 255;

/// Code recorded on jobs found active after a restart under the fail policy.
pub const INTERRUPTED_CODE: &str = "INTERRUPTED";

/// Result of a start or retry request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StartOutcome {
    pub job_id: Uuid,
    /// True when the request attached to a job already running for the key
    pub already_running: bool,
}

/// What restart recovery did with the jobs it found active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed: Vec<Uuid>,
    pub resumed: Vec<Uuid>,
}

#[derive(Clone)]
pub struct SyncController {
    repo: SyncJobRepository,
    registry: Arc<KeyRegistry>,
    worker: Arc<SyncWorker>,
    publisher: ProgressPublisher,
    max_items_per_job: usize,
}

impl SyncController {
    pub fn new(
        db: sea_orm::DatabaseConnection,
        pusher: Arc<dyn ItemPusher>,
        engine: &SyncEngineConfig,
        rate_limit_policy: &RateLimitPolicyConfig,
    ) -> Result<Self, ConfigError> {
        let governor = RateLimitGovernor::new(rate_limit_policy.clone())?;
        Ok(Self::with_governor(db, pusher, engine, governor))
    }

    pub fn with_governor(
        db: sea_orm::DatabaseConnection,
        pusher: Arc<dyn ItemPusher>,
        engine: &SyncEngineConfig,
        governor: RateLimitGovernor,
    ) -> Self {
        let repo = SyncJobRepository::new(db);
        let registry = Arc::new(KeyRegistry::new());
        let worker = Arc::new(SyncWorker::new(
            repo.clone(),
            pusher,
            governor,
            Arc::clone(&registry),
            Duration::from_secs(engine.push_timeout_seconds),
        ));
        let publisher = ProgressPublisher::new(repo.clone(), engine.max_snapshot_errors);

        Self {
            repo,
            registry,
            worker,
            publisher,
            max_items_per_job: engine.max_items_per_job,
        }
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// Start a sync for `destination_key`, or attach to the job already
    /// running for it. Attaching ignores the submitted items.
    pub async fn start(
        &self,
        destination_key: &str,
        items: Vec<ItemInput>,
    ) -> Result<StartOutcome, SyncError> {
        let destination_key = validate_key(destination_key)?;
        self.validate_items(&items)?;
        self.start_job(destination_key, items, None).await
    }

    async fn start_job(
        &self,
        destination_key: &str,
        items: Vec<ItemInput>,
        parent_job_id: Option<Uuid>,
    ) -> Result<StartOutcome, SyncError> {
        loop {
            let mut acquisition = self.registry.acquire(destination_key);

            if acquisition.already_running {
                if acquisition.wait_ready().await {
                    info!(
                        job_id = %acquisition.job_id,
                        destination_key = %destination_key,
                        "Attached to running sync job"
                    );
                    return Ok(StartOutcome {
                        job_id: acquisition.job_id,
                        already_running: true,
                    });
                }
                // The owner gave up before persisting; contend again.
                continue;
            }

            // Create and launch on a detached task: a dropped request must
            // neither strand the reservation nor leave a job without a loop.
            let owner = tokio::spawn({
                let controller = self.clone();
                let destination_key = destination_key.to_string();
                let job_id = acquisition.job_id;
                let cancel = acquisition.cancel;
                async move {
                    controller
                        .create_and_launch(job_id, destination_key, cancel, items, parent_job_id)
                        .await
                }
            });
            return owner
                .await
                .map_err(|join_error| SyncError::WorkerAborted(join_error.to_string()))?;
        }
    }

    async fn create_and_launch(
        &self,
        job_id: Uuid,
        destination_key: String,
        cancel: tokio_util::sync::CancellationToken,
        items: Vec<ItemInput>,
        parent_job_id: Option<Uuid>,
    ) -> Result<StartOutcome, SyncError> {
        let reservation =
            ReservationGuard::new(Arc::clone(&self.registry), destination_key.as_str(), job_id);

        match self
            .repo
            .create(job_id, &destination_key, &items, parent_job_id)
            .await
        {
            Ok(_) => {
                self.registry.mark_ready(&destination_key, job_id);
                self.launch(job_id, &destination_key, cancel);
                reservation.disarm();
                Ok(StartOutcome {
                    job_id,
                    already_running: false,
                })
            }
            Err(err) if is_unique_violation(&err) => {
                // Another process owns the key.
                drop(reservation);
                if let Some(existing) = self.repo.find_active_by_key(&destination_key).await? {
                    warn!(
                        job_id = %existing.id,
                        destination_key = %destination_key,
                        "Destination key held by a job outside this process"
                    );
                    return Ok(StartOutcome {
                        job_id: existing.id,
                        already_running: true,
                    });
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn launch(
        &self,
        job_id: Uuid,
        destination_key: &str,
        cancel: tokio_util::sync::CancellationToken,
    ) -> JoinHandle<JobState> {
        self.worker
            .spawn(job_id, destination_key.to_string(), cancel)
    }

    pub async fn progress(&self, job_id: Uuid) -> Result<SyncSnapshot, SyncError> {
        self.publisher.snapshot(job_id).await
    }

    /// Full job record including every item.
    pub async fn job_record(&self, job_id: Uuid) -> Result<JobRecord, SyncError> {
        self.repo
            .get(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))
    }

    /// Request cancellation. The loop stops before its next item; an
    /// in-flight push completes and is recorded. Cancelling a finished job is
    /// a no-op.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), SyncError> {
        let job = self
            .repo
            .find_job(job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))?;
        let state = job
            .job_state()
            .map_err(|e| SyncError::corrupt(job_id, e))?;

        if state.is_terminal() {
            return Ok(());
        }

        if let Some(cancel) = self.registry.cancellation(&job.destination_key, job_id) {
            info!(job_id = %job_id, "Cancellation requested");
            cancel.cancel();
            return Ok(());
        }

        // No local loop owns the job; finish it directly so the key frees up.
        if self.repo.set_state(job_id, &StateChange::Cancelled).await? {
            info!(job_id = %job_id, "Cancelled sync job without a local work loop");
        }
        Ok(())
    }

    /// Start a new job for `destination_key` that re-pushes the given items,
    /// taking each payload from the most recent job that contained it.
    pub async fn retry_subset(
        &self,
        destination_key: &str,
        item_ids: Vec<String>,
    ) -> Result<StartOutcome, SyncError> {
        let destination_key = validate_key(destination_key)?;

        let mut seen = HashSet::new();
        let item_ids: Vec<String> = item_ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        if item_ids.is_empty() {
            return Err(SyncError::invalid("item_ids", "must not be empty"));
        }
        if item_ids.len() > self.max_items_per_job {
            return Err(SyncError::invalid(
                "item_ids",
                format!("at most {} items per job", self.max_items_per_job),
            ));
        }

        let sources = self
            .repo
            .latest_items_for_key(destination_key, &item_ids)
            .await?;

        let mut items = Vec::with_capacity(item_ids.len());
        let mut unknown = Vec::new();
        for id in &item_ids {
            match sources.iter().find(|item| &item.external_id == id) {
                Some(source) => items.push(source),
                None => unknown.push(id.clone()),
            }
        }
        if !unknown.is_empty() {
            return Err(SyncError::UnknownItems {
                key: destination_key.to_string(),
                item_ids: unknown,
            });
        }

        // Lineage points at the newest job the items came from
        let parent_job_id = match self.newest_job(items.iter().map(|item| item.job_id)).await? {
            Some(parent) => Some(parent),
            None => items.first().map(|item| item.job_id),
        };
        let inputs = items.into_iter().map(item_input).collect();

        self.start_job(destination_key, inputs, parent_job_id).await
    }

    async fn newest_job(
        &self,
        job_ids: impl Iterator<Item = Uuid>,
    ) -> Result<Option<Uuid>, SyncError> {
        let mut newest: Option<(chrono::DateTime<chrono::FixedOffset>, Uuid)> = None;
        let unique: HashSet<Uuid> = job_ids.collect();
        for job_id in unique {
            if let Some(job) = self.repo.find_job(job_id).await?
                && newest.is_none_or(|(created, _)| job.created_at > created)
            {
                newest = Some((job.created_at, job.id));
            }
        }
        Ok(newest.map(|(_, id)| id))
    }

    /// The non-terminal job for `destination_key`, if any.
    pub async fn active_job(&self, destination_key: &str) -> Result<Option<Uuid>, SyncError> {
        let destination_key = validate_key(destination_key)?;
        if let Some(job_id) = self.registry.active_job(destination_key) {
            return Ok(Some(job_id));
        }
        Ok(self
            .repo
            .find_active_by_key(destination_key)
            .await?
            .map(|job| job.id))
    }

    /// Deal with jobs that were active when the process last stopped.
    pub async fn recover_interrupted(
        &self,
        policy: RestartPolicy,
    ) -> Result<RecoveryReport, SyncError> {
        let mut report = RecoveryReport::default();

        for job in self.repo.list_active().await? {
            match policy {
                RestartPolicy::Fail => {
                    let change = StateChange::Failed {
                        code: INTERRUPTED_CODE.to_string(),
                        message: format!(
                            "Interrupted by service restart after {} of {} items",
                            job.cursor, job.total_items
                        ),
                    };
                    if self.repo.set_state(job.id, &change).await? {
                        warn!(job_id = %job.id, destination_key = %job.destination_key, "Marked interrupted sync job as failed");
                        report.failed.push(job.id);
                    }
                }
                RestartPolicy::Resume => {
                    let Some(cancel) = self.registry.adopt(&job.destination_key, job.id) else {
                        warn!(job_id = %job.id, destination_key = %job.destination_key, "Destination key already held; not resuming");
                        continue;
                    };
                    info!(job_id = %job.id, cursor = job.cursor, "Resuming interrupted sync job");
                    self.launch(job.id, &job.destination_key, cancel);
                    report.resumed.push(job.id);
                }
            }
        }

        Ok(report)
    }

    fn validate_items(&self, items: &[ItemInput]) -> Result<(), SyncError> {
        if items.is_empty() {
            return Err(SyncError::invalid("items", "must not be empty"));
        }
        if items.len() > self.max_items_per_job {
            return Err(SyncError::invalid(
                "items",
                format!("at most {} items per job", self.max_items_per_job),
            ));
        }

        let mut seen = HashSet::with_capacity(items.len());
        for item in items {
            if item.external_id.trim().is_empty() {
                return Err(SyncError::invalid(
                    "items",
                    "every item needs a non-empty external_id",
                ));
            }
            if !seen.insert(item.external_id.as_str()) {
                return Err(SyncError::invalid(
                    "items",
                    format!("duplicate external_id '{}'", item.external_id),
                ));
            }
        }
        Ok(())
    }
}

fn validate_key(destination_key: &str) -> Result<&str, SyncError> {
    let trimmed = destination_key.trim();
    if trimmed.is_empty() {
        return Err(SyncError::invalid("destination_key", "must not be empty"));
    }
    if trimmed.len() > MAX_DESTINATION_KEY_LEN {
        return Err(SyncError::invalid(
            "destination_key",
            format!("must be at most {} characters", MAX_DESTINATION_KEY_LEN),
        ));
    }
    Ok(trimmed)
}
