use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tb_bridge::http_api::{api_router, BridgeState};
use tb_core::config::Config;
use tb_session::registry::{RegistryConfig, SessionRegistry};
use tb_session::spawn::{CommandResolver, StaticCommand};
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// State whose sessions run `sh -c 'sleep 30'` under a temporary workdir root.
fn test_state(workdir: &tempfile::TempDir) -> Arc<BridgeState> {
    let registry = Arc::new(SessionRegistry::new(RegistryConfig {
        close_grace: Duration::from_millis(100),
        ..RegistryConfig::default()
    }));
    let resolver: Arc<dyn CommandResolver> = Arc::new(
        StaticCommand::new("/bin/sh", workdir.path()).with_args(["-c", "sleep 30"]),
    );
    Arc::new(BridgeState::from_config(&Config::default(), registry, resolver))
}

async fn start_test_server(state: Arc<BridgeState>) -> String {
    let router = api_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ===========================================================================
// Health
// ===========================================================================

#[tokio::test]
async fn test_health_reports_session_count() {
    let workdir = tempfile::tempdir().unwrap();
    let state = test_state(&workdir);
    let app = api_router(state);

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let workdir = tempfile::tempdir().unwrap();
    let app = api_router(test_state(&workdir));

    let response = app
        .oneshot(
            Request::get("/health")
                .header("x-request-id", "abc123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "abc123");
}

// ===========================================================================
// Session listing and closing
// ===========================================================================

#[tokio::test]
async fn test_list_and_close_sessions() {
    let workdir = tempfile::tempdir().unwrap();
    let state = test_state(&workdir);
    let base = start_test_server(state.clone()).await;
    let client = reqwest::Client::new();

    let empty: Vec<Value> = client
        .get(format!("{base}/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(empty.is_empty());

    let first = state
        .registry
        .create_or_get("ticket-1", state.resolver.as_ref())
        .await
        .unwrap();
    let second = state
        .registry
        .create_or_get("ticket-2", state.resolver.as_ref())
        .await
        .unwrap();
    assert!(workdir.path().join("ticket-1").is_dir());

    let listed: Vec<Value> = client
        .get(format!("{base}/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["logical_key"], "ticket-1");
    assert_eq!(listed[0]["session_id"], first.id().to_string());
    assert_eq!(listed[0]["attached"], false);
    assert!(listed[0]["pid"].is_u64());

    let resp = client
        .delete(format!("{base}/api/sessions/{}", first.id()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["closed"], first.id().to_string());
    assert!(first.is_closed());

    // Closing twice is a 404 the second time.
    let resp = client
        .delete(format!("{base}/api/sessions/{}", first.id()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let listed: Vec<Value> = client
        .get(format!("{base}/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["session_id"], second.id().to_string());

    state.registry.shutdown().await;
}

#[tokio::test]
async fn test_close_rejects_bad_ids() {
    let workdir = tempfile::tempdir().unwrap();
    let app = api_router(test_state(&workdir));

    let response = app
        .clone()
        .oneshot(
            Request::delete("/api/sessions/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("not-a-uuid"));

    let response = app
        .oneshot(
            Request::delete(format!("/api/sessions/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_plain_get_on_ws_route_is_not_upgraded() {
    let workdir = tempfile::tempdir().unwrap();
    let base = start_test_server(test_state(&workdir)).await;

    let resp = reqwest::get(format!("{base}/ws/sessions/ticket-9"))
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}
