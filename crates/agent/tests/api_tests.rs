//! Integration tests for the operator API router.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use tower::ServiceExt;

use wings_agent_lib::console::StreamManager;
use wings_agent_lib::health::{HealthTracker, Subsystem};
use wings_agent_lib::observability::AgentMetrics;
use wings_agent_lib::runtime::{
    async_trait, ContainerDetails, ContainerSummary, EventStream, FrameStream, NetworkStats,
    OutputStream, Runtime, StatsSnapshot, SERVER_ID_LABEL,
};

#[path = "../src/api.rs"]
mod api;

const TEST_SECRET: &str = "test-secret-that-is-long-enough-for-hmac";

/// Canned runtime for router tests: one managed workload `s1` backed by
/// container `c1`.
#[derive(Default)]
struct StubRuntime {
    power_calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Runtime for StubRuntime {
    async fn list_running(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        let mut labels = std::collections::HashMap::new();
        labels.insert(SERVER_ID_LABEL.to_string(), "s1".to_string());
        Ok(vec![
            ContainerSummary {
                id: "c1".to_string(),
                server_id: Some("s1".to_string()),
                labels,
            },
            ContainerSummary {
                id: "c2".to_string(),
                server_id: None,
                labels: std::collections::HashMap::new(),
            },
        ])
    }

    async fn stats_once(&self, _container_id: &str) -> anyhow::Result<StatsSnapshot> {
        Ok(StatsSnapshot {
            cpu_total: 1_500_000,
            cpu_system: 2_000_000,
            pre_cpu_total: 1_000_000,
            pre_cpu_system: 1_000_000,
            online_cpus: 2,
            mem_usage_bytes: 256 * 1024 * 1024,
            storage_write_bytes: Some(32 * 1024 * 1024),
            networks: vec![NetworkStats { tx_bytes: 1000 }],
        })
    }

    async fn inspect(&self, _container_id: &str) -> anyhow::Result<ContainerDetails> {
        Ok(ContainerDetails { started_at: None })
    }

    async fn start(&self, _container_id: &str) -> anyhow::Result<()> {
        self.power_calls.lock().unwrap().push("start".to_string());
        Ok(())
    }

    async fn stop(&self, _container_id: &str) -> anyhow::Result<()> {
        self.power_calls.lock().unwrap().push("stop".to_string());
        Ok(())
    }

    async fn restart(&self, _container_id: &str) -> anyhow::Result<()> {
        self.power_calls.lock().unwrap().push("restart".to_string());
        Ok(())
    }

    async fn kill(&self, _container_id: &str) -> anyhow::Result<()> {
        self.power_calls.lock().unwrap().push("kill".to_string());
        Ok(())
    }

    async fn logs_follow(&self, _container_id: &str) -> anyhow::Result<FrameStream> {
        Ok(Box::pin(futures::stream::pending()))
    }

    async fn logs_tail(&self, _container_id: &str, _lines: usize) -> anyhow::Result<String> {
        Ok("line one\nline two\n".to_string())
    }

    async fn exec(&self, _container_id: &str, _cmd: Vec<String>) -> anyhow::Result<OutputStream> {
        Ok(Box::pin(futures::stream::iter(vec![Ok(Bytes::from(
            "command output\n",
        ))])))
    }

    async fn events(&self) -> EventStream {
        Box::pin(futures::stream::pending())
    }
}

fn test_app() -> (axum::Router, Arc<StubRuntime>) {
    let runtime = Arc::new(StubRuntime::default());
    let metrics = AgentMetrics::new();

    let state = Arc::new(api::AppState {
        runtime: runtime.clone() as Arc<dyn Runtime>,
        streams: Arc::new(StreamManager::new(
            runtime.clone() as Arc<dyn Runtime>,
            metrics.clone(),
        )),
        health: HealthTracker::new(),
        metrics,
        token_secret: TEST_SECRET.to_string(),
        started_at: Instant::now(),
    });

    (api::create_router(state), runtime)
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    exp: i64,
}

fn bearer_token() -> String {
    let claims = Claims {
        sub: "operator".to_string(),
        exp: now_unix() + 600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn authed(request: Request<Body>) -> Request<Body> {
    let (mut parts, body) = request.into_parts();
    parts.headers.insert(
        "authorization",
        format!("Bearer {}", bearer_token()).parse().unwrap(),
    );
    Request::from_parts(parts, body)
}

#[tokio::test]
async fn health_is_open() {
    let (app, _) = test_app();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn healthz_reports_healthy() {
    let (app, _) = test_app();

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn healthz_unhealthy_is_503() {
    let runtime = Arc::new(StubRuntime::default());
    let metrics = AgentMetrics::new();
    let health = HealthTracker::new();

    let state = Arc::new(api::AppState {
        runtime: runtime.clone() as Arc<dyn Runtime>,
        streams: Arc::new(StreamManager::new(
            runtime as Arc<dyn Runtime>,
            metrics.clone(),
        )),
        health: health.clone(),
        metrics,
        token_secret: TEST_SECRET.to_string(),
        started_at: Instant::now(),
    });
    let app = api::create_router(state);

    health.fail(Subsystem::Runtime, "docker daemon unreachable");

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn api_requires_bearer_token() {
    let (app, _) = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/system/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Missing authorization header");
}

#[tokio::test]
async fn api_rejects_malformed_and_forged_tokens() {
    let (app, _) = test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/system/status")
                .header("authorization", "Basic abc123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Invalid authorization format");

    let (app, _) = test_app();
    let forged = encode(
        &Header::default(),
        &Claims {
            sub: "intruder".to_string(),
            exp: now_unix() + 600,
        },
        &EncodingKey::from_secret(b"some-other-secret"),
    )
    .unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/system/status")
                .header("authorization", format!("Bearer {forged}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Invalid token");
}

#[tokio::test]
async fn system_status_reports_vitals() {
    let (app, _) = test_app();

    let response = app
        .oneshot(authed(
            Request::builder()
                .uri("/api/system/status")
                .body(Body::empty())
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["version"].is_string());
    assert_eq!(body["workloads"], 1);
}

#[tokio::test]
async fn power_action_dispatches_to_runtime() {
    let (app, runtime) = test_app();

    let response = app
        .oneshot(authed(
            Request::builder()
                .method("POST")
                .uri("/api/servers/s1/power")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"action":"restart"}"#))
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(*runtime.power_calls.lock().unwrap(), vec!["restart"]);
}

#[tokio::test]
async fn power_rejects_unknown_action() {
    let (app, runtime) = test_app();

    let response = app
        .oneshot(authed(
            Request::builder()
                .method("POST")
                .uri("/api/servers/s1/power")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"action":"reboot"}"#))
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Invalid action");
    assert!(runtime.power_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_server_is_404() {
    let (app, _) = test_app();

    let response = app
        .oneshot(authed(
            Request::builder()
                .method("POST")
                .uri("/api/servers/nope/power")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"action":"start"}"#))
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn logs_endpoint_returns_lines() {
    let (app, _) = test_app();

    let response = app
        .oneshot(authed(
            Request::builder()
                .uri("/api/servers/s1/logs?lines=2")
                .body(Body::empty())
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["logs"][0], "line one");
    assert_eq!(body["logs"][1], "line two");
}

#[tokio::test]
async fn command_endpoint_returns_output() {
    let (app, _) = test_app();

    let response = app
        .oneshot(authed(
            Request::builder()
                .method("POST")
                .uri("/api/servers/s1/command")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"command":"list"}"#))
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["output"], "command output\n");
}

#[tokio::test]
async fn stats_endpoint_computes_cpu_percent() {
    let (app, _) = test_app();

    let response = app
        .oneshot(authed(
            Request::builder()
                .uri("/api/servers/s1/stats")
                .body(Body::empty())
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    // (500k / 1M) * 2 cpus * 100
    assert_eq!(body["cpuUsagePercent"], 100.0);
    assert_eq!(body["memUsageMb"], 256);
    assert_eq!(body["diskUsageMb"], 32);
    assert_eq!(body["netTxBytes"], 1000);
}
