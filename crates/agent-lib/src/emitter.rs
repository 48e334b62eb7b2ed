//! Metrics emitter: periodic workload telemetry, overflow buffering, and
//! the node heartbeat.
//!
//! Delivery is best-effort. Failed batches land in a bounded in-memory
//! buffer that is flushed as one extra POST after the next successful
//! live batch; on overflow the oldest samples are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::models::{now_rfc3339, BatchMetricsPayload, Heartbeat, Sample};
use crate::observability::AgentMetrics;
use crate::runtime::{Runtime, StatsSnapshot};
use crate::transport::ControlPlane;

const BYTES_PER_MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub collect_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Overflow buffer bound; oldest samples are dropped beyond it.
    pub max_buffer: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            max_buffer: 1000,
        }
    }
}

pub struct MetricsEmitter {
    runtime: Arc<dyn Runtime>,
    control: Arc<dyn ControlPlane>,
    node_id: String,
    config: EmitterConfig,
    buffer: Mutex<VecDeque<Sample>>,
    last_network: Mutex<HashMap<String, u64>>,
    metrics: AgentMetrics,
}

impl MetricsEmitter {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        control: Arc<dyn ControlPlane>,
        node_id: impl Into<String>,
        config: EmitterConfig,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            runtime,
            control,
            node_id: node_id.into(),
            config,
            buffer: Mutex::new(VecDeque::new()),
            last_network: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Collection loop. The first cycle runs immediately, then on the
    /// configured cadence.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.collect_interval.as_secs(),
            "starting metrics emitter"
        );

        let mut ticker = tokio::time::interval(self.config.collect_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.collect_and_send().await,
                _ = shutdown.recv() => {
                    info!("metrics emitter stopped");
                    return;
                }
            }
        }
    }

    /// Heartbeat loop, independent of collection. Failures are logged and
    /// never buffered.
    pub async fn run_heartbeat(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        // The interval's first tick is immediate; the heartbeat cadence
        // starts one period in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.heartbeat().await {
                    Ok(()) => {
                        self.metrics.inc_heartbeats_sent();
                        debug!("heartbeat sent");
                    }
                    Err(e) => {
                        self.metrics.inc_heartbeat_failures();
                        error!(error = %e, "failed to send heartbeat");
                    }
                },
                _ = shutdown.recv() => {
                    info!("heartbeat stopped");
                    return;
                }
            }
        }
    }

    async fn collect_and_send(&self) {
        let containers = match self.runtime.list_running().await {
            Ok(containers) => containers,
            Err(e) => {
                error!(error = %e, "failed to list containers");
                return;
            }
        };

        let mut samples = Vec::with_capacity(containers.len());
        for container in containers {
            let Some(server_id) = container.server_id else {
                continue;
            };
            match self.sample(&server_id, &container.id).await {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    self.metrics.inc_sample_errors();
                    error!(
                        server_id = %server_id,
                        container_id = %container.id,
                        error = %e,
                        "failed to collect stats, skipping sample"
                    );
                }
            }
        }

        if samples.is_empty() {
            debug!("no samples collected");
            return;
        }

        self.metrics.add_samples_collected(samples.len() as u64);
        debug!(count = samples.len(), "collected metrics samples");

        let payload = BatchMetricsPayload {
            node_id: self.node_id.clone(),
            timestamp: now_rfc3339(),
            samples,
        };

        match self.control.post_metrics(&payload).await {
            Ok(()) => self.flush_buffer().await,
            Err(e) => {
                self.metrics.inc_metrics_post_failures();
                error!(error = %e, "failed to send metrics, buffering batch");
                self.buffer_samples(payload.samples).await;
            }
        }
    }

    async fn sample(&self, server_id: &str, container_id: &str) -> Result<Sample> {
        let stats = self
            .runtime
            .stats_once(container_id)
            .await
            .context("read stats")?;

        let net_egress_bytes = self.net_egress(container_id, &stats).await;

        let uptime_seconds = match self.runtime.inspect(container_id).await {
            Ok(details) => uptime_seconds(details.started_at.as_deref()),
            Err(_) => 0,
        };

        Ok(Sample {
            server_id: server_id.to_string(),
            timestamp: now_rfc3339(),
            cpu_usage_percent: cpu_percent(&stats),
            mem_usage_mb: (stats.mem_usage_bytes / BYTES_PER_MIB) as i64,
            disk_usage_mb: (stats.storage_write_bytes.unwrap_or(0) / BYTES_PER_MIB) as i64,
            net_egress_bytes,
            uptime_seconds,
        })
    }

    /// Egress delta against the previous observation of this container.
    /// Counters reset with the container, so a shrinking total clamps to 0,
    /// and the first observation reports 0.
    async fn net_egress(&self, container_id: &str, stats: &StatsSnapshot) -> i64 {
        let total: u64 = stats.networks.iter().map(|n| n.tx_bytes).sum();
        let mut last = self.last_network.lock().await;
        match last.insert(container_id.to_string(), total) {
            Some(previous) => total.saturating_sub(previous) as i64,
            None => 0,
        }
    }

    async fn buffer_samples(&self, samples: Vec<Sample>) {
        let mut buffer = self.buffer.lock().await;
        buffer.extend(samples);

        let mut dropped = 0u64;
        while buffer.len() > self.config.max_buffer {
            buffer.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.metrics.add_samples_dropped(dropped);
            warn!(dropped, "metrics buffer overflow, dropped oldest samples");
        }

        self.metrics.set_buffered_samples(buffer.len() as i64);
        info!(buffered = buffer.len(), "buffered metrics samples");
    }

    /// Send everything buffered as one batch, after a successful live
    /// POST. The buffer is only cleared once the flush POST succeeds.
    async fn flush_buffer(&self) {
        let pending: Vec<Sample> = {
            let buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            buffer.iter().cloned().collect()
        };

        info!(count = pending.len(), "flushing buffered metrics");
        let payload = BatchMetricsPayload {
            node_id: self.node_id.clone(),
            timestamp: now_rfc3339(),
            samples: pending,
        };

        match self.control.post_metrics(&payload).await {
            Ok(()) => {
                let mut buffer = self.buffer.lock().await;
                let drain_count = payload.samples.len().min(buffer.len());
                buffer.drain(..drain_count);
                self.metrics.set_buffered_samples(buffer.len() as i64);
                info!("buffered metrics flushed");
            }
            Err(e) => error!(error = %e, "failed to flush buffered metrics"),
        }
    }

    async fn heartbeat(&self) -> Result<()> {
        self.control
            .post_heartbeat(&Heartbeat::healthy(&self.node_id))
            .await
    }

    pub async fn buffered_len(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

/// CPU usage percentage from the runtime's cumulative counters. Defined
/// only when both deltas are strictly positive, otherwise exactly 0.0.
pub fn cpu_percent(stats: &StatsSnapshot) -> f64 {
    let cpu_delta = stats.cpu_total as f64 - stats.pre_cpu_total as f64;
    let system_delta = stats.cpu_system as f64 - stats.pre_cpu_system as f64;
    if cpu_delta > 0.0 && system_delta > 0.0 {
        (cpu_delta / system_delta) * f64::from(stats.online_cpus) * 100.0
    } else {
        0.0
    }
}

/// Whole seconds since an RFC3339 start time, or 0 if absent/unparseable.
pub fn uptime_seconds(started_at: Option<&str>) -> i64 {
    let Some(started_at) = started_at else {
        return 0;
    };
    match DateTime::parse_from_rfc3339(started_at) {
        Ok(start) => (Utc::now() - start.with_timezone(&Utc)).num_seconds().max(0),
        Err(_) => 0,
    }
}
