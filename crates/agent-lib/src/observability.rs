//! Observability for the node agent: Prometheus metrics and structured
//! lifecycle logging.

use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Global metrics instance (registered once in the default registry).
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    samples_collected: IntCounter,
    sample_errors: IntCounter,
    samples_dropped: IntCounter,
    buffered_samples: IntGauge,
    metrics_post_failures: IntCounter,
    heartbeats_sent: IntCounter,
    heartbeat_failures: IntCounter,
    restarts_scheduled: IntCounter,
    restarts_failed: IntCounter,
    workloads_failed: IntCounter,
    console_streams: IntGauge,
    console_subscribers: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            samples_collected: register_int_counter!(
                "wings_agent_samples_collected_total",
                "Telemetry samples collected from workload containers"
            )
            .expect("register samples_collected"),

            sample_errors: register_int_counter!(
                "wings_agent_sample_errors_total",
                "Per-container stat reads that failed and were skipped"
            )
            .expect("register sample_errors"),

            samples_dropped: register_int_counter!(
                "wings_agent_samples_dropped_total",
                "Buffered samples dropped by the overflow policy"
            )
            .expect("register samples_dropped"),

            buffered_samples: register_int_gauge!(
                "wings_agent_buffered_samples",
                "Samples currently held in the overflow buffer"
            )
            .expect("register buffered_samples"),

            metrics_post_failures: register_int_counter!(
                "wings_agent_metrics_post_failures_total",
                "Metrics batch POSTs rejected by the control plane"
            )
            .expect("register metrics_post_failures"),

            heartbeats_sent: register_int_counter!(
                "wings_agent_heartbeats_sent_total",
                "Heartbeats accepted by the control plane"
            )
            .expect("register heartbeats_sent"),

            heartbeat_failures: register_int_counter!(
                "wings_agent_heartbeat_failures_total",
                "Heartbeats the control plane did not accept"
            )
            .expect("register heartbeat_failures"),

            restarts_scheduled: register_int_counter!(
                "wings_agent_restarts_scheduled_total",
                "Workload restarts scheduled by the crash guard"
            )
            .expect("register restarts_scheduled"),

            restarts_failed: register_int_counter!(
                "wings_agent_restarts_failed_total",
                "Restart attempts where the runtime call failed"
            )
            .expect("register restarts_failed"),

            workloads_failed: register_int_counter!(
                "wings_agent_workloads_failed_total",
                "Workloads marked terminally failed"
            )
            .expect("register workloads_failed"),

            console_streams: register_int_gauge!(
                "wings_agent_console_streams",
                "Live console streams"
            )
            .expect("register console_streams"),

            console_subscribers: register_int_gauge!(
                "wings_agent_console_subscribers",
                "Connected console subscribers across all streams"
            )
            .expect("register console_subscribers"),
        }
    }
}

/// Lightweight handle to the global metrics; clones share the instance.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    pub fn add_samples_collected(&self, count: u64) {
        self.inner().samples_collected.inc_by(count);
    }

    pub fn inc_sample_errors(&self) {
        self.inner().sample_errors.inc();
    }

    pub fn add_samples_dropped(&self, count: u64) {
        self.inner().samples_dropped.inc_by(count);
    }

    pub fn set_buffered_samples(&self, count: i64) {
        self.inner().buffered_samples.set(count);
    }

    pub fn inc_metrics_post_failures(&self) {
        self.inner().metrics_post_failures.inc();
    }

    pub fn inc_heartbeats_sent(&self) {
        self.inner().heartbeats_sent.inc();
    }

    pub fn inc_heartbeat_failures(&self) {
        self.inner().heartbeat_failures.inc();
    }

    pub fn inc_restarts_scheduled(&self) {
        self.inner().restarts_scheduled.inc();
    }

    pub fn inc_restarts_failed(&self) {
        self.inner().restarts_failed.inc();
    }

    pub fn inc_workloads_failed(&self) {
        self.inner().workloads_failed.inc();
    }

    pub fn set_console_streams(&self, count: i64) {
        self.inner().console_streams.set(count);
    }

    pub fn add_console_subscribers(&self, delta: i64) {
        self.inner().console_subscribers.add(delta);
    }
}

/// Structured logger for significant agent lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_id: String,
}

impl StructuredLogger {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            node = %self.node_id,
            agent_version = %version,
            "Wings agent started"
        );
    }

    pub fn log_degraded_start(&self, reason: &str) {
        warn!(
            event = "agent_degraded",
            node = %self.node_id,
            reason = %reason,
            "Supervision disabled; serving local operator requests only"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_id,
            reason = %reason,
            "Wings agent shutting down"
        );
    }
}
