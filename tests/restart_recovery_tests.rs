//! Restart recovery: jobs left active by a previous process are either failed
//! or resumed from their persisted cursor.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use listing_sync::config::RestartPolicy;
use listing_sync::models::JobState;
use listing_sync::repositories::{ItemResult, StateChange, SyncJobRepository};
use listing_sync::sync::INTERRUPTED_CODE;
use tempfile::TempDir;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::{
    ScriptedPusher, controller_with, items, setup_file_db, wait_for_release, wait_for_terminal,
};

const WAIT: Duration = Duration::from_secs(15);

/// Leave a four item job RUNNING with two items processed, as a crashed
/// process would, then close the store.
async fn interrupted_job(path: &Path) -> Result<Uuid> {
    let db = setup_file_db(path).await?;
    let repo = SyncJobRepository::new(db.clone());

    let job_id = Uuid::new_v4();
    repo.create(job_id, "shop-1", &items(4), None).await?;
    assert!(repo.set_state(job_id, &StateChange::Running).await?);
    assert!(repo.record_item(job_id, 0, &ItemResult::Success, 1).await?);
    assert!(repo.record_item(job_id, 1, &ItemResult::Success, 1).await?);

    db.close().await?;
    Ok(job_id)
}

#[tokio::test]
async fn fail_policy_marks_interrupted_jobs_failed() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("sync.db");
    let job_id = interrupted_job(&path).await?;

    let db = setup_file_db(&path).await?;
    let pusher = ScriptedPusher::new();
    let controller = controller_with(db, pusher.clone());

    let report = controller.recover_interrupted(RestartPolicy::Fail).await?;
    assert_eq!(report.failed, vec![job_id]);
    assert!(report.resumed.is_empty());

    let snapshot = controller.progress(job_id).await?;
    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.last_error_code.as_deref(), Some(INTERRUPTED_CODE));
    assert_eq!(snapshot.processed, 2);
    assert!(snapshot.finished_at.is_some());
    assert!(pusher.calls().is_empty());

    // The key is free for a fresh job
    assert_eq!(controller.active_job("shop-1").await?, None);
    let next = controller.start("shop-1", items(1)).await?;
    assert!(!next.already_running);
    wait_for_terminal(&controller, next.job_id, WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn resume_policy_continues_from_the_cursor() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("sync.db");
    let job_id = interrupted_job(&path).await?;

    let db = setup_file_db(&path).await?;
    let pusher = ScriptedPusher::new();
    let gate = pusher.gate("sku-3");
    let controller = controller_with(db, pusher.clone());

    let report = controller.recover_interrupted(RestartPolicy::Resume).await?;
    assert_eq!(report.resumed, vec![job_id]);
    gate.reached.notified().await;

    // A start request for the key attaches to the resumed job
    let attached = controller.start("shop-1", items(2)).await?;
    assert!(attached.already_running);
    assert_eq!(attached.job_id, job_id);

    gate.release.notify_one();
    let done = wait_for_terminal(&controller, job_id, WAIT).await?;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.completed, 4);

    let pushed: Vec<String> = pusher.calls().into_iter().map(|(_, id)| id).collect();
    assert_eq!(pushed, vec!["sku-3", "sku-4"]);

    wait_for_release(&controller, "shop-1", WAIT).await?;
    Ok(())
}

#[tokio::test]
async fn resume_policy_honours_a_pending_rate_limit_pause() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("sync.db");
    let job_id = interrupted_job(&path).await?;

    {
        let db = setup_file_db(&path).await?;
        let repo = SyncJobRepository::new(db.clone());
        let paused = StateChange::PausedRateLimit {
            retry_at: Utc::now() + chrono::Duration::seconds(1),
            pauses: 1,
            code: "RATE_LIMITED".to_string(),
            message: "Too many requests".to_string(),
        };
        assert!(repo.set_state(job_id, &paused).await?);
        db.close().await?;
    }

    let db = setup_file_db(&path).await?;
    let pusher = ScriptedPusher::new();
    let controller = controller_with(db, pusher.clone());

    let clock = Instant::now();
    controller.recover_interrupted(RestartPolicy::Resume).await?;

    let paused = controller.progress(job_id).await?;
    assert_eq!(paused.state, JobState::PausedRateLimit);
    assert!(paused.retry_at.is_some());

    let done = wait_for_terminal(&controller, job_id, WAIT).await?;
    assert!(clock.elapsed() >= Duration::from_millis(800));
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(pusher.pushes_of("sku-3"), 1);
    assert_eq!(pusher.pushes_of("sku-1"), 0);
    Ok(())
}

#[tokio::test]
async fn recovery_ignores_finished_jobs() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("sync.db");
    let job_id = interrupted_job(&path).await?;

    let db = setup_file_db(&path).await?;
    let repo = SyncJobRepository::new(db.clone());
    assert!(repo.set_state(job_id, &StateChange::Cancelled).await?);

    let controller = controller_with(db, ScriptedPusher::new());
    let report = controller.recover_interrupted(RestartPolicy::Resume).await?;
    assert!(report.failed.is_empty());
    assert!(report.resumed.is_empty());

    let snapshot = controller.progress(job_id).await?;
    assert_eq!(snapshot.state, JobState::Cancelled);
    Ok(())
}
