//! In-process registry of active jobs keyed by destination key.
//!
//! `acquire` is a single critical section: two concurrent starts for the same
//! key always observe each other. The database carries a partial unique index
//! on active jobs as a second line for multi-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Reservation {
    job_id: Uuid,
    cancel: CancellationToken,
    /// Flipped to true once the job record exists
    ready: watch::Sender<bool>,
}

/// Result of [`KeyRegistry::acquire`].
#[derive(Debug)]
pub struct Acquisition {
    pub job_id: Uuid,
    pub already_running: bool,
    pub cancel: CancellationToken,
    ready: watch::Receiver<bool>,
}

impl Acquisition {
    /// Wait until the owner of this reservation has persisted its job.
    ///
    /// Returns false when the reservation was abandoned before that happened.
    pub async fn wait_ready(&mut self) -> bool {
        self.ready.wait_for(|ready| *ready).await.is_ok()
    }
}

/// Releases a reservation when dropped, unless [`disarm`](Self::disarm)ed
/// once the job record exists and its loop is running.
pub struct ReservationGuard {
    registry: Arc<KeyRegistry>,
    key: String,
    job_id: Uuid,
    armed: bool,
}

impl ReservationGuard {
    pub fn new(registry: Arc<KeyRegistry>, key: impl Into<String>, job_id: Uuid) -> Self {
        Self {
            registry,
            key: key.into(),
            job_id,
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.armed && self.registry.release(&self.key, self.job_id) {
            tracing::debug!(job_id = %self.job_id, destination_key = %self.key, "Released unclaimed reservation");
        }
    }
}

#[derive(Default)]
pub struct KeyRegistry {
    active: Mutex<HashMap<String, Reservation>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Reservation>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve `key` for a fresh job id, or return the job already holding it.
    pub fn acquire(&self, key: &str) -> Acquisition {
        let mut active = self.lock();
        if let Some(existing) = active.get(key) {
            return Acquisition {
                job_id: existing.job_id,
                already_running: true,
                cancel: existing.cancel.clone(),
                ready: existing.ready.subscribe(),
            };
        }

        let job_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (ready, ready_rx) = watch::channel(false);
        active.insert(
            key.to_string(),
            Reservation {
                job_id,
                cancel: cancel.clone(),
                ready,
            },
        );
        Acquisition {
            job_id,
            already_running: false,
            cancel,
            ready: ready_rx,
        }
    }

    /// Register a job that already exists in the store (restart recovery).
    ///
    /// Returns None when another job holds the key.
    pub fn adopt(&self, key: &str, job_id: Uuid) -> Option<CancellationToken> {
        let mut active = self.lock();
        if let Some(existing) = active.get(key) {
            return (existing.job_id == job_id).then(|| existing.cancel.clone());
        }
        let cancel = CancellationToken::new();
        let (ready, _) = watch::channel(true);
        active.insert(
            key.to_string(),
            Reservation {
                job_id,
                cancel: cancel.clone(),
                ready,
            },
        );
        Some(cancel)
    }

    /// Mark the job record as persisted so attached callers can return.
    pub fn mark_ready(&self, key: &str, job_id: Uuid) {
        if let Some(reservation) = self.lock().get(key)
            && reservation.job_id == job_id
        {
            reservation.ready.send_replace(true);
        }
    }

    /// Free `key` if it is still held by `job_id`. Releasing twice is a no-op.
    pub fn release(&self, key: &str, job_id: Uuid) -> bool {
        let mut active = self.lock();
        match active.get(key) {
            Some(reservation) if reservation.job_id == job_id => {
                active.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn active_job(&self, key: &str) -> Option<Uuid> {
        self.lock().get(key).map(|reservation| reservation.job_id)
    }

    /// Cancellation flag of the job holding `key`, if it is `job_id`.
    pub fn cancellation(&self, key: &str, job_id: Uuid) -> Option<CancellationToken> {
        self.lock()
            .get(key)
            .filter(|reservation| reservation.job_id == job_id)
            .map(|reservation| reservation.cancel.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
