//! Test utilities for sync engine testing.
//!
//! In-memory SQLite databases with migrations applied, a scriptable push
//! collaborator and polling helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use listing_sync::config::{RateLimitPolicyConfig, SyncEngineConfig};
use listing_sync::sync::{
    ItemInput, ItemPusher, PushError, PushReceipt, PushResult, SyncController, SyncSnapshot,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tokio::sync::Notify;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool is pinned to a single connection so every query sees the same
/// in-memory database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    Ok(db)
}

/// Opens (creating if needed) a file-backed SQLite database with migrations applied.
pub async fn setup_file_db(path: &Path) -> Result<DatabaseConnection> {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let mut options = ConnectOptions::new(url);
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    Ok(db)
}

/// Engine settings suited to tests: short timeouts, no jitter.
pub fn test_engine_config() -> SyncEngineConfig {
    SyncEngineConfig {
        push_timeout_seconds: 5,
        ..SyncEngineConfig::default()
    }
}

pub fn test_rate_limit_policy() -> RateLimitPolicyConfig {
    RateLimitPolicyConfig {
        min_seconds: 1,
        base_seconds: 1,
        max_seconds: 5,
        jitter_factor: 0.0,
        ..RateLimitPolicyConfig::default()
    }
}

pub fn controller_with(db: DatabaseConnection, pusher: Arc<dyn ItemPusher>) -> SyncController {
    SyncController::new(
        db,
        pusher,
        &test_engine_config(),
        &test_rate_limit_policy(),
    )
    .expect("valid test engine configuration")
}

/// `count` items named sku-1..sku-count.
pub fn items(count: usize) -> Vec<ItemInput> {
    (1..=count)
        .map(|n| ItemInput {
            external_id: format!("sku-{}", n),
            payload: serde_json::json!({ "sku": format!("sku-{}", n), "price": n * 100 }),
        })
        .collect()
}

/// Scripted reply for one push of an external id.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok,
    Fail(PushError),
    RateLimited(Option<u64>),
    Panic,
}

pub fn hard_failure(code: &str, message: &str) -> Reply {
    Reply::Fail(PushError::Http {
        status: 422,
        code: Some(code.to_string()),
        message: message.to_string(),
        retry_after_secs: None,
    })
}

/// Records every push and replies from a per-item script; unscripted pushes
/// succeed. Optional gates hold a push until released.
#[derive(Default)]
pub struct ScriptedPusher {
    script: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<Vec<(String, String)>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    delay: Mutex<Option<Duration>>,
}

pub struct Gate {
    pub reached: Notify,
    pub release: Notify,
}

impl ScriptedPusher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue replies for `external_id`, consumed in order.
    pub fn script(&self, external_id: &str, replies: Vec<Reply>) {
        self.script
            .lock()
            .unwrap()
            .insert(external_id.to_string(), replies);
    }

    /// Block pushes of `external_id` until the returned gate is released.
    pub fn gate(&self, external_id: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate {
            reached: Notify::new(),
            release: Notify::new(),
        });
        self.gates
            .lock()
            .unwrap()
            .insert(external_id.to_string(), Arc::clone(&gate));
        gate
    }

    /// Sleep this long inside every push.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// (destination_key, external_id) of every push, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pushes_of(&self, external_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, id)| id == external_id)
            .count()
    }
}

#[async_trait]
impl ItemPusher for ScriptedPusher {
    async fn push(&self, destination_key: &str, item: &ItemInput) -> PushResult {
        self.calls
            .lock()
            .unwrap()
            .push((destination_key.to_string(), item.external_id.clone()));

        let gate = self.gates.lock().unwrap().remove(&item.external_id);
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = {
            let mut script = self.script.lock().unwrap();
            match script.get_mut(&item.external_id) {
                Some(replies) if !replies.is_empty() => replies.remove(0),
                _ => Reply::Ok,
            }
        };

        match reply {
            Reply::Ok => Ok(PushReceipt {
                destination_id: Some(format!("dest-{}", item.external_id)),
            }),
            Reply::Fail(error) => Err(error),
            Reply::RateLimited(retry_after_secs) => Err(PushError::Http {
                status: 429,
                code: Some("RATE_LIMITED".to_string()),
                message: "Too many requests".to_string(),
                retry_after_secs,
            }),
            Reply::Panic => panic!("scripted push panic for {}", item.external_id),
        }
    }
}

/// Poll until the job reaches a terminal state.
pub async fn wait_for_terminal(
    controller: &SyncController,
    job_id: Uuid,
    timeout: Duration,
) -> Result<SyncSnapshot> {
    wait_for(controller, job_id, timeout, |s| s.state.is_terminal()).await
}

/// Poll until `predicate` holds for the job's snapshot.
pub async fn wait_for<F>(
    controller: &SyncController,
    job_id: Uuid,
    timeout: Duration,
    predicate: F,
) -> Result<SyncSnapshot>
where
    F: Fn(&SyncSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = controller.progress(job_id).await?;
        if predicate(&snapshot) {
            return Ok(snapshot);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "timed out waiting for job {}; last state {:?} ({})",
                job_id,
                snapshot.state,
                snapshot.current_step
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the destination key is free in the registry.
pub async fn wait_for_release(controller: &SyncController, key: &str, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while controller.registry().active_job(key).is_some() {
        if tokio::time::Instant::now() >= deadline {
            bail!("destination key {} still held", key);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
