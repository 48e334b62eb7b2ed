//! Wings node agent daemon.
//!
//! Wires the runtime adapter, control-plane transport, crash guard,
//! metrics emitter, console stream manager, and the operator HTTP
//! surface, and owns the shutdown ordering.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wings_agent_lib::console::StreamManager;
use wings_agent_lib::emitter::{EmitterConfig, MetricsEmitter};
use wings_agent_lib::guard::{CrashGuard, RestartPolicy};
use wings_agent_lib::health::{HealthTracker, Subsystem};
use wings_agent_lib::observability::{AgentMetrics, StructuredLogger};
use wings_agent_lib::runtime::{DockerRuntime, Runtime};
use wings_agent_lib::transport::{ControlPlane, ControlPlaneClient, NodeIdentity};

mod api;
mod config;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = config::WingsConfig::load()?;

    let default_filter = if cfg.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(fmt::layer().json())
        .init();

    info!(version = VERSION, "starting wings agent");

    let metrics = AgentMetrics::new();
    let health = HealthTracker::new();

    let runtime: Arc<dyn Runtime> = Arc::new(DockerRuntime::connect()?);
    info!("docker runtime initialized");

    let streams = Arc::new(StreamManager::new(runtime.clone(), metrics.clone()));

    let (emitter_shutdown, _) = broadcast::channel::<()>(1);
    let (guard_shutdown, _) = broadcast::channel::<()>(1);
    let (server_shutdown, _) = broadcast::channel::<()>(1);

    let mut emitter_tasks = Vec::new();
    let mut guard_tasks = Vec::new();
    let mut logger = StructuredLogger::new("unknown");

    // Without a complete node identity the agent runs degraded: no
    // supervision, no telemetry, local operator endpoints only.
    match NodeIdentity::from_env() {
        Ok(identity) => {
            logger = StructuredLogger::new(&identity.node_id);
            match ControlPlaneClient::new(&identity) {
                Ok(client) => {
                    info!(node_id = %identity.node_id, api = %identity.api_base_url, "control-plane client initialized");
                    let control: Arc<dyn ControlPlane> = Arc::new(client);

                    let emitter = Arc::new(MetricsEmitter::new(
                        runtime.clone(),
                        control.clone(),
                        &identity.node_id,
                        EmitterConfig {
                            collect_interval: Duration::from_secs(cfg.metrics_interval_secs),
                            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
                            ..Default::default()
                        },
                        metrics.clone(),
                    ));

                    let collector = emitter.clone();
                    let rx = emitter_shutdown.subscribe();
                    emitter_tasks.push(tokio::spawn(async move { collector.run(rx).await }));

                    let heartbeat = emitter.clone();
                    let rx = emitter_shutdown.subscribe();
                    emitter_tasks
                        .push(tokio::spawn(async move { heartbeat.run_heartbeat(rx).await }));

                    let guard = Arc::new(CrashGuard::new(
                        runtime.clone(),
                        control,
                        &identity.node_id,
                        RestartPolicy::default(),
                        metrics.clone(),
                    ));
                    let rx = guard_shutdown.subscribe();
                    guard_tasks.push(tokio::spawn(async move { guard.run(rx).await }));
                }
                Err(e) => {
                    logger.log_degraded_start(&e.to_string());
                    health.fail(Subsystem::ControlPlane, e.to_string());
                }
            }
        }
        Err(e) => {
            logger.log_degraded_start(&e.to_string());
            health.degrade(Subsystem::ControlPlane, e.to_string());
            health.degrade(Subsystem::CrashGuard, "node identity incomplete");
            health.degrade(Subsystem::MetricsEmitter, "node identity incomplete");
        }
    }

    if cfg.token_secret.is_empty() {
        warn!("token_secret is not set; operator API tokens cannot be validated securely");
    }

    health.mark_started();
    logger.log_startup(VERSION);

    let app_state = Arc::new(api::AppState {
        runtime,
        streams: streams.clone(),
        health,
        metrics,
        token_secret: cfg.token_secret.clone(),
        started_at: Instant::now(),
    });

    let server_rx = server_shutdown.subscribe();
    let server = tokio::spawn(api::serve(cfg.host.clone(), cfg.port, app_state, server_rx));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => logger.log_shutdown("SIGINT received"),
        _ = sigterm.recv() => logger.log_shutdown("SIGTERM received"),
    }

    // Shutdown order: emitter, crash guard, console streams, HTTP server.
    let _ = emitter_shutdown.send(());
    for task in emitter_tasks {
        let _ = task.await;
    }

    let _ = guard_shutdown.send(());
    for task in guard_tasks {
        let _ = task.await;
    }

    streams.shutdown().await;

    let _ = server_shutdown.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "operator API exited with error"),
        Err(e) => warn!(error = %e, "operator API task aborted"),
    }

    info!("agent exited");
    Ok(())
}
