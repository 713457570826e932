//! # Listing Sync Main Entry Point
//!
//! This is the main entry point for the listing sync service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use listing_sync::{
    config::ConfigLoader,
    db,
    server::{AppState, run_server, shutdown_signal},
    sync::{HttpItemPusher, SyncController},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from layered env files and variables
    let config_loader = ConfigLoader::new();
    let config = config_loader.load()?;

    telemetry::init_tracing(&config)?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config).await?;
    db::run_migrations(&db).await?;

    let api_base = config
        .destination_api_base
        .as_deref()
        .context("LISTING_SYNC_DESTINATION_API_BASE must be set to push items")?;
    let pusher = HttpItemPusher::new(
        api_base,
        config.destination_api_token.clone(),
        Duration::from_secs(config.sync.push_timeout_seconds),
    )?;

    let controller = SyncController::new(
        db.clone(),
        Arc::new(pusher),
        &config.sync,
        &config.rate_limit_policy,
    )?;

    let report = controller
        .recover_interrupted(config.sync.restart_policy)
        .await?;
    if !report.failed.is_empty() || !report.resumed.is_empty() {
        tracing::info!(
            failed = report.failed.len(),
            resumed = report.resumed.len(),
            "Recovered sync jobs interrupted by the last shutdown"
        );
    }

    let state = AppState {
        config: Arc::new(config),
        db,
        controller,
    };

    run_server(state, shutdown_signal()).await
}
