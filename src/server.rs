//! # Server Configuration
//!
//! This module contains the server setup and configuration for the listing sync API.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers;
use crate::sync::SyncController;
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub controller: SyncController,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/sync/jobs", post(handlers::sync::start_sync))
        .route("/sync/jobs/retry", post(handlers::sync::retry_subset))
        .route("/sync/jobs/{id}", get(handlers::sync::get_progress))
        .route("/sync/jobs/{id}/items", get(handlers::sync::get_job_items))
        .route("/sync/jobs/{id}/cancel", post(handlers::sync::cancel_sync))
        .route("/sync/active", get(handlers::sync::active_job))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(telemetry::trace_context_middleware))
}

/// Starts the server and serves until `shutdown` resolves.
///
/// Jobs still running when the listener stops keep their persisted state and
/// are picked up by the restart policy on the next start.
pub async fn run_server<F>(state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = state.config.bind_addr()?;
    let controller = state.controller.clone();
    let app = create_app(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %addr,
        profile = %state.config.profile,
        "Listing sync API listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    let running = controller.registry().len();
    if running > 0 {
        tracing::warn!(
            jobs = running,
            "Shutting down with sync jobs in flight; restart policy decides their fate"
        );
    }

    Ok(())
}

/// Resolves on Ctrl-C (and SIGTERM on unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::readyz,
        crate::handlers::sync::start_sync,
        crate::handlers::sync::get_progress,
        crate::handlers::sync::get_job_items,
        crate::handlers::sync::cancel_sync,
        crate::handlers::sync::retry_subset,
        crate::handlers::sync::active_job,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthStatus,
            crate::handlers::sync::StartSyncRequest,
            crate::handlers::sync::RetrySubsetRequest,
            crate::handlers::sync::ActiveJobResponse,
            crate::handlers::sync::CancelResponse,
            crate::handlers::sync::JobItemsResponse,
            crate::handlers::sync::JobItemInfo,
            crate::sync::ItemInput,
            crate::sync::StartOutcome,
            crate::sync::SyncSnapshot,
            crate::sync::progress::SnapshotError,
            crate::models::JobState,
            crate::models::ItemStatus,
            crate::models::ItemError,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "sync", description = "Listing sync jobs"),
        (name = "health", description = "Liveness and readiness probes"),
    ),
    info(
        title = "Listing Sync API",
        description = "Pushes mapped product records to destination accounts with rate-limit aware pausing",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
