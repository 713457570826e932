//! # Tests for Handlers
//!
//! This module contains unit tests for API handlers.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::handlers::{healthz, readyz, root};
use crate::server::{AppState, create_app};
use crate::sync::{ItemInput, ItemPusher, PushReceipt, PushResult, SyncController};
use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    extract::State,
    http::{Request, StatusCode},
    response::Json,
};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::Value;
use tower::ServiceExt;

struct AcceptAll;

#[async_trait]
impl ItemPusher for AcceptAll {
    async fn push(&self, _destination_key: &str, _item: &ItemInput) -> PushResult {
        Ok(PushReceipt::default())
    }
}

async fn migrated_db() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1);
    let db = Database::connect(options).await.expect("connect sqlite");
    crate::db::run_migrations(&db).await.expect("migrate");
    db
}

fn state_with(db: DatabaseConnection) -> AppState {
    let config = AppConfig::default();
    let controller = SyncController::new(
        db.clone(),
        Arc::new(AcceptAll),
        &config.sync,
        &config.rate_limit_policy,
    )
    .expect("controller");
    AppState {
        config: Arc::new(config),
        db,
        controller,
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn test_root_handler_returns_expected_service_info() {
    let Json(service_info) = root().await;

    assert_eq!(service_info.service, "listing-sync");
    assert_eq!(service_info.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_healthz_is_ok() {
    let Json(status) = healthz().await;
    assert_eq!(status.status, "ok");
}

#[tokio::test]
async fn test_readyz_with_live_database() {
    let state = state_with(migrated_db().await);
    let Json(status) = readyz(State(state)).await.expect("ready");
    assert_eq!(status.status, "ready");
}

#[tokio::test]
async fn test_start_rejects_empty_items_with_problem_json() {
    let app = create_app(state_with(migrated_db().await));

    let response = app
        .oneshot(
            Request::post("/sync/jobs")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"destination_key":"shop-1","items":[]}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    let body = json_body(response).await;
    assert_eq!(body["code"], "VALIDATION_FAILED");
    assert_eq!(body["details"]["items"], "must not be empty");
}

#[tokio::test]
async fn test_malformed_job_id_is_a_validation_error() {
    let app = create_app(state_with(migrated_db().await));

    let response = app
        .oneshot(
            Request::get("/sync/jobs/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["details"]["id"], "Must be a valid UUID");
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let app = create_app(state_with(migrated_db().await));

    let response = app
        .oneshot(
            Request::get(format!("/sync/jobs/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_active_job_without_key_is_a_problem_response() {
    let app = create_app(state_with(migrated_db().await));

    let response = app
        .oneshot(Request::get("/sync/active").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    let body = json_body(response).await;
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_idle_key_reports_inactive_without_job_id() {
    let app = create_app(state_with(migrated_db().await));

    let response = app
        .oneshot(
            Request::get("/sync/active?destination_key=shop-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["destination_key"], "shop-1");
    assert_eq!(body["active"], false);
    assert!(body.get("job_id").is_none());
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = create_app(state_with(migrated_db().await));

    let response = app
        .oneshot(
            Request::get("/healthz")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-42");
}

#[tokio::test]
async fn test_openapi_document_lists_sync_routes() {
    use utoipa::OpenApi;

    let doc = serde_json::to_value(crate::server::ApiDoc::openapi()).unwrap();
    let paths = doc["paths"].as_object().unwrap();
    for path in [
        "/sync/jobs",
        "/sync/jobs/{id}",
        "/sync/jobs/{id}/items",
        "/sync/jobs/{id}/cancel",
        "/sync/jobs/retry",
        "/sync/active",
    ] {
        assert!(paths.contains_key(path), "missing {}", path);
    }
}
