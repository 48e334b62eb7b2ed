//! Crash guard: event-driven restart supervision with bounded backoff and
//! terminal-failure escalation.
//!
//! One task drains the runtime event stream; every restart runs in its
//! own task so backoff sleeps never block event processing. State is
//! keyed by container id, so a redeployed container for the same workload
//! starts a fresh history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::models::CrashEvent;
use crate::observability::AgentMetrics;
use crate::runtime::{EventAction, Runtime, RuntimeEvent};
use crate::transport::ControlPlane;

/// Fixed delay before re-reading a failed runtime event stream.
const EVENT_STREAM_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(5 * 60),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart attempt `n` (1-based):
    /// `min(base * multiplier * (n - 1), max)`. The schedule is linear in
    /// `n - 1`; attempt 1 is immediate. The control plane expects this
    /// exact schedule.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.backoff_base.as_secs_f64()
            * self.backoff_multiplier
            * f64::from(attempt.saturating_sub(1));
        Duration::from_secs_f64(scaled).min(self.backoff_max)
    }
}

/// Restart bookkeeping for one container id.
#[derive(Debug, Clone, Default)]
pub struct RestartState {
    pub server_id: String,
    pub attempts: u32,
    pub consecutive_fails: u32,
    pub last_crash: Option<DateTime<Utc>>,
    pub last_restart: Option<DateTime<Utc>>,
    pub failed: bool,
}

pub struct CrashGuard {
    runtime: Arc<dyn Runtime>,
    control: Arc<dyn ControlPlane>,
    node_id: String,
    policy: RestartPolicy,
    states: Arc<Mutex<HashMap<String, RestartState>>>,
    metrics: AgentMetrics,
}

impl CrashGuard {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        control: Arc<dyn ControlPlane>,
        node_id: impl Into<String>,
        policy: RestartPolicy,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            runtime,
            control,
            node_id: node_id.into(),
            policy,
            states: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    /// Drain runtime events until shutdown. Stream errors back off 5 s and
    /// continue; an ended stream is resubscribed. Never fatal.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            max_attempts = self.policy.max_attempts,
            backoff_base_ms = self.policy.backoff_base.as_millis() as u64,
            "starting crash guard"
        );

        let mut events = self.runtime.events().await;
        loop {
            tokio::select! {
                item = events.next() => match item {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => {
                        error!(error = %e, "runtime event stream error");
                        tokio::time::sleep(EVENT_STREAM_BACKOFF).await;
                    }
                    None => {
                        warn!("runtime event stream ended, resubscribing");
                        tokio::time::sleep(EVENT_STREAM_BACKOFF).await;
                        events = self.runtime.events().await;
                    }
                },
                _ = shutdown.recv() => {
                    info!("crash guard stopped");
                    return;
                }
            }
        }
    }

    async fn handle_event(&self, event: RuntimeEvent) {
        // The server_id label is the isolation boundary: anything without
        // it is not ours to supervise.
        let Some(server_id) = event.server_id().map(str::to_string) else {
            return;
        };

        match event.action {
            EventAction::Die | EventAction::Stop => {
                let exit_code = event.exit_code().unwrap_or("").to_string();
                self.handle_exit(event.container_id, server_id, exit_code)
                    .await;
            }
            EventAction::Start => {
                let mut states = self.states.lock().await;
                if let Some(state) = states.get_mut(&event.container_id) {
                    state.consecutive_fails = 0;
                }
                debug!(server_id = %server_id, "workload started");
            }
        }
    }

    async fn handle_exit(&self, container_id: String, server_id: String, exit_code: String) {
        info!(
            server_id = %server_id,
            container_id = %container_id,
            exit_code = %exit_code,
            "workload stopped"
        );

        // Exit code 0 is a clean shutdown; leave state untouched.
        if exit_code == "0" {
            debug!(server_id = %server_id, "workload exited cleanly, not restarting");
            return;
        }

        let (attempt, backoff) = {
            let mut states = self.states.lock().await;
            let state = states
                .entry(container_id.clone())
                .or_insert_with(|| RestartState {
                    server_id: server_id.clone(),
                    ..Default::default()
                });

            if state.failed {
                debug!(server_id = %server_id, "workload terminally failed, ignoring exit");
                return;
            }

            state.attempts += 1;
            state.consecutive_fails += 1;
            state.last_crash = Some(Utc::now());

            if state.attempts >= self.policy.max_attempts {
                state.failed = true;
                let attempts = state.attempts;
                drop(states);

                error!(
                    server_id = %server_id,
                    attempts,
                    "workload exceeded max restart attempts"
                );
                self.metrics.inc_workloads_failed();
                self.notify_event(CrashEvent::failed(
                    &self.node_id,
                    &server_id,
                    format!("Exceeded max restart attempts ({})", self.policy.max_attempts),
                ))
                .await;
                return;
            }

            (state.attempts, self.policy.backoff_for_attempt(state.attempts))
        };

        info!(
            server_id = %server_id,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            "scheduling workload restart"
        );
        self.metrics.inc_restarts_scheduled();

        let runtime = self.runtime.clone();
        let control = self.control.clone();
        let states = self.states.clone();
        let node_id = self.node_id.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;

            match runtime.restart(&container_id).await {
                Ok(()) => {
                    info!(server_id = %server_id, attempt, "workload restarted");
                    {
                        let mut states = states.lock().await;
                        if let Some(state) = states.get_mut(&container_id) {
                            state.last_restart = Some(Utc::now());
                        }
                    }
                    let event = CrashEvent::crash(&node_id, &server_id, &exit_code, attempt);
                    if let Err(e) = control.post_event(&event).await {
                        error!(server_id = %server_id, error = %e, "failed to send crash event");
                    }
                }
                Err(e) => {
                    metrics.inc_restarts_failed();
                    error!(server_id = %server_id, error = %e, "failed to restart workload");
                    let event =
                        CrashEvent::failed(&node_id, &server_id, format!("Restart failed: {e}"));
                    if let Err(e) = control.post_event(&event).await {
                        error!(server_id = %server_id, error = %e, "failed to send failed event");
                    }
                }
            }
        });
    }

    async fn notify_event(&self, event: CrashEvent) {
        if let Err(e) = self.control.post_event(&event).await {
            error!(server_id = %event.server_id, error = %e, "failed to send workload event");
        }
    }

    /// Restart bookkeeping for a container, if any exists.
    pub async fn state(&self, container_id: &str) -> Option<RestartState> {
        self.states.lock().await.get(container_id).cloned()
    }

    /// Forget a container's restart history. The only way a terminally
    /// failed workload becomes eligible for restarts again.
    pub async fn reset(&self, container_id: &str) -> bool {
        let removed = self.states.lock().await.remove(container_id).is_some();
        if removed {
            info!(container_id = %container_id, "restart state reset");
        }
        removed
    }
}
