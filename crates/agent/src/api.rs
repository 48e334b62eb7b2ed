//! Operator HTTP surface: health probes, Prometheus metrics, and the
//! authenticated `/api` routes for workload power, logs, commands, stats,
//! and the console WebSocket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{decode, DecodingKey, Validation};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use wings_agent_lib::console::{ConsoleStream, StreamManager, SUBSCRIBER_QUEUE_DEPTH};
use wings_agent_lib::emitter::{cpu_percent, uptime_seconds};
use wings_agent_lib::health::{Condition, HealthTracker};
use wings_agent_lib::observability::AgentMetrics;
use wings_agent_lib::runtime::{collect_output, Runtime};

/// Wall-clock bound on one-shot operator commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_LOG_LINES: usize = 100;

pub struct AppState {
    pub runtime: Arc<dyn Runtime>,
    pub streams: Arc<StreamManager>,
    pub health: HealthTracker,
    pub metrics: AgentMetrics,
    pub token_secret: String,
    pub started_at: Instant,
}

/// Operator-facing error: JSON `{"success": false, "error": ...}` with an
/// appropriate status.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

/// Claims the agent cares about; signature and expiry are checked by the
/// library.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
}

async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("Invalid authorization format"))?;

    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.token_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        warn!(error = %e, "rejected operator token");
        ApiError::unauthorized("Invalid token")
    })?;

    debug!(subject = ?decoded.claims.sub, "operator request authorized");
    Ok(next.run(request).await)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.liveness();
    let status_code = match report.status {
        Condition::Healthy | Condition::Degraded => StatusCode::OK,
        Condition::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(report))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness();
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(ApiError::internal)?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    ))
}

async fn system_status(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let workloads = state
        .runtime
        .list_running()
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .filter(|c| c.server_id.is_some())
        .count();

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "cpuCount": std::thread::available_parallelism().map(usize::from).unwrap_or(0),
        "workloads": workloads,
    })))
}

/// Resolve a workload id to its backing container id.
async fn resolve_container(state: &AppState, server_id: &str) -> Result<String, ApiError> {
    let containers = state
        .runtime
        .list_running()
        .await
        .map_err(ApiError::internal)?;

    containers
        .into_iter()
        .find(|c| c.server_id.as_deref() == Some(server_id))
        .map(|c| c.id)
        .ok_or_else(|| ApiError::not_found(format!("unknown server: {server_id}")))
}

#[derive(Debug, Deserialize)]
struct PowerRequest {
    action: String,
}

async fn server_power(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
    Json(body): Json<PowerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let container_id = resolve_container(&state, &server_id).await?;

    let result = match body.action.as_str() {
        "start" => state.runtime.start(&container_id).await,
        "stop" => state.runtime.stop(&container_id).await,
        "restart" => state.runtime.restart(&container_id).await,
        "kill" => state.runtime.kill(&container_id).await,
        _ => return Err(ApiError::bad_request("Invalid action")),
    };

    result.map_err(|e| {
        warn!(server_id = %server_id, action = %body.action, error = %e, "power action failed");
        ApiError::internal(e)
    })?;

    info!(server_id = %server_id, action = %body.action, "power action executed");
    Ok(Json(json!({
        "success": true,
        "message": "Power action executed successfully",
    })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn server_logs(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let container_id = resolve_container(&state, &server_id).await?;
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);

    let output = state
        .runtime
        .logs_tail(&container_id, lines)
        .await
        .map_err(ApiError::internal)?;

    let lines: Vec<&str> = output.lines().collect();
    Ok(Json(json!({ "logs": lines })))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

async fn server_command(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let container_id = resolve_container(&state, &server_id).await?;

    let output = state
        .runtime
        .exec(
            &container_id,
            vec!["/bin/sh".to_string(), "-c".to_string(), body.command],
        )
        .await
        .map_err(ApiError::internal)?;

    let collected = tokio::time::timeout(COMMAND_TIMEOUT, collect_output(output))
        .await
        .map_err(|_| ApiError::internal("command timed out"))?
        .map_err(ApiError::internal)?;

    Ok(Json(json!({ "success": true, "output": collected })))
}

async fn server_stats(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let container_id = resolve_container(&state, &server_id).await?;

    let stats = state
        .runtime
        .stats_once(&container_id)
        .await
        .map_err(ApiError::internal)?;
    let uptime = match state.runtime.inspect(&container_id).await {
        Ok(details) => uptime_seconds(details.started_at.as_deref()),
        Err(_) => 0,
    };

    let mib = 1024 * 1024;
    Ok(Json(json!({
        "serverId": server_id,
        "cpuUsagePercent": cpu_percent(&stats),
        "memUsageMb": stats.mem_usage_bytes / mib,
        "diskUsageMb": stats.storage_write_bytes.unwrap_or(0) / mib,
        "netTxBytes": stats.networks.iter().map(|n| n.tx_bytes).sum::<u64>(),
        "uptimeSeconds": uptime,
    })))
}

async fn console_ws(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let container_id = resolve_container(&state, &server_id).await?;
    let stream = state
        .streams
        .get_or_create(&server_id, &container_id)
        .await
        .map_err(ApiError::internal)?;

    Ok(ws.on_upgrade(move |socket| handle_console_socket(socket, stream)))
}

/// Drive one console connection: replay-then-live log entries outbound,
/// command messages inbound. Protocol violations are answered on this
/// socket only; the stream itself is never torn down for them.
async fn handle_console_socket(socket: WebSocket, stream: Arc<ConsoleStream>) {
    let (subscriber, mut entries) = stream.subscribe().await;
    let (mut sink, mut inbound) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(SUBSCRIBER_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let log_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(entry) = entries.recv().await {
            let Ok(payload) = serde_json::to_string(&entry) else {
                continue;
            };
            if log_tx.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(item) = inbound.next().await {
        match item {
            Ok(Message::Text(text)) => {
                if let Err(e) = stream.handle_command(subscriber, &text).await {
                    let reply = json!({ "success": false, "error": e.to_string() }).to_string();
                    if out_tx.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "console socket receive error");
                break;
            }
        }
    }

    stream.unsubscribe(subscriber).await;
    drop(out_tx);
    forwarder.abort();
    writer.abort();
    info!(server_id = %stream.server_id(), "console connection closed");
}

pub fn create_router(state: Arc<AppState>) -> axum::Router {
    let api = axum::Router::new()
        .route("/system/status", get(system_status))
        .route("/servers/{server_id}/power", post(server_power))
        .route("/servers/{server_id}/logs", get(server_logs))
        .route("/servers/{server_id}/command", post(server_command))
        .route("/servers/{server_id}/stats", get(server_stats))
        .route("/servers/{server_id}/console", get(console_ws))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    axum::Router::new()
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .nest("/api", api)
        .with_state(state)
}

/// Serve the operator API until the shutdown signal fires.
pub async fn serve(
    host: String,
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr = format!("{host}:{port}");
    info!(addr = %addr, "starting operator API");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
