//! End-to-end tests for the sync HTTP surface against a live listener.

use std::sync::Arc;
use std::time::Duration;

use listing_sync::config::AppConfig;
use listing_sync::server::{AppState, create_app};
use reqwest::Client;
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::{ScriptedPusher, controller_with, hard_failure, setup_test_db};

struct TestServer {
    url: String,
    pusher: Arc<ScriptedPusher>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn spawn_test_app() -> TestServer {
    let db = setup_test_db().await.unwrap();
    let pusher = ScriptedPusher::new();
    let controller = controller_with(db.clone(), pusher.clone());
    let state = AppState {
        config: Arc::new(AppConfig::default()),
        db,
        controller,
    };
    let app = create_app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        url: format!("http://{}", addr),
        pusher,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    }
}

fn body_items(count: usize) -> Value {
    let items: Vec<Value> = (1..=count)
        .map(|n| json!({ "external_id": format!("sku-{}", n), "payload": { "price": n } }))
        .collect();
    Value::Array(items)
}

async fn poll_until_terminal(client: &Client, url: &str, job_id: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let snapshot: Value = client
            .get(format!("{}/sync/jobs/{}", url, job_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let state = snapshot["state"].as_str().unwrap_or_default().to_string();
        if matches!(state.as_str(), "COMPLETED" | "FAILED" | "CANCELLED") {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {}",
            job_id,
            state
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_start_poll_and_inspect_items() {
    let server = spawn_test_app().await;
    server
        .pusher
        .script("sku-2", vec![hard_failure("MISSING_TITLE", "title is required")]);
    let client = Client::new();

    let response = client
        .post(format!("{}/sync/jobs", server.url))
        .json(&json!({ "destination_key": "shop-1", "items": body_items(3) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let started: Value = response.json().await.unwrap();
    assert_eq!(started["already_running"], false);
    let job_id = started["job_id"].as_str().unwrap().to_string();

    let snapshot = poll_until_terminal(&client, &server.url, &job_id).await;
    assert_eq!(snapshot["state"], "COMPLETED");
    assert_eq!(snapshot["completed"], 2);
    assert_eq!(snapshot["failed"], 1);
    assert_eq!(snapshot["percent"], 100.0);
    assert_eq!(snapshot["errors"][0]["external_id"], "sku-2");
    assert_eq!(snapshot["errors"][0]["error"]["code"], "MISSING_TITLE");
    assert!(snapshot.get("retry_at").is_none());

    let items: Value = client
        .get(format!("{}/sync/jobs/{}/items", server.url, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(items["cursor"], 3);
    assert_eq!(items["items"][0]["status"], "success");
    assert_eq!(items["items"][1]["status"], "failed");
    assert_eq!(items["items"][1]["error"]["message"], "title is required");

    server.stop().await;
}

#[tokio::test]
async fn test_second_start_returns_running_job_with_200() {
    let server = spawn_test_app().await;
    let gate = server.pusher.gate("sku-1");
    let client = Client::new();
    let request = json!({ "destination_key": "shop-9", "items": body_items(2) });

    let first = client
        .post(format!("{}/sync/jobs", server.url))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 202);
    let first: Value = first.json().await.unwrap();
    gate.reached.notified().await;

    let second = client
        .post(format!("{}/sync/jobs", server.url))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let second: Value = second.json().await.unwrap();
    assert_eq!(second["already_running"], true);
    assert_eq!(second["job_id"], first["job_id"]);

    let active: Value = client
        .get(format!("{}/sync/active?destination_key=shop-9", server.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active["active"], true);
    assert_eq!(active["job_id"], first["job_id"]);

    let cancel = client
        .post(format!(
            "{}/sync/jobs/{}/cancel",
            server.url,
            first["job_id"].as_str().unwrap()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(cancel.status(), 200);
    gate.release.notify_one();

    let snapshot = poll_until_terminal(&client, &server.url, first["job_id"].as_str().unwrap()).await;
    assert_eq!(snapshot["state"], "CANCELLED");
    assert_eq!(snapshot["processed"], 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let idle = loop {
        let idle: Value = client
            .get(format!("{}/sync/active?destination_key=shop-9", server.url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if idle["active"] == false || tokio::time::Instant::now() >= deadline {
            break idle;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_eq!(idle["active"], false);
    assert!(idle.get("job_id").is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_retry_with_unknown_items_is_rejected() {
    let server = spawn_test_app().await;
    let client = Client::new();

    let response = client
        .post(format!("{}/sync/jobs/retry", server.url))
        .json(&json!({ "destination_key": "shop-1", "item_ids": ["sku-404"] }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_FAILED");
    assert_eq!(body["details"]["unknown"], json!(["sku-404"]));

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_start_body_is_a_problem_response() {
    let server = spawn_test_app().await;
    let client = Client::new();

    let response = client
        .post(format!("{}/sync/jobs", server.url))
        .header("content-type", "application/json")
        .body(r#"{"destination_key": 5}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    assert!(server.pusher.calls().is_empty());

    server.stop().await;
}
