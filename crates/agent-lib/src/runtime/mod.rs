//! Container runtime abstraction.
//!
//! The supervisory subsystems (crash guard, metrics emitter, console
//! streams) talk to the container runtime only through the [`Runtime`]
//! trait, which keeps them testable against a deterministic fake.

mod docker;

#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerRuntime;

use std::collections::HashMap;

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::BoxStream;

pub use async_trait::async_trait;

/// Label that marks a container as a managed tenant workload. Containers
/// without it are invisible to every subsystem.
pub const SERVER_ID_LABEL: &str = "io.mamba.server_id";

/// Length of the multiplexed log frame header.
pub const FRAME_HEADER_LEN: usize = 8;

/// Frame header stream markers.
pub const FRAME_STDOUT: u8 = 1;
pub const FRAME_STDERR: u8 = 2;

/// Stream of raw multiplexed frames: an 8-byte header (byte 0 is the
/// stream marker, bytes 4..8 the big-endian payload length) followed by
/// the payload.
pub type FrameStream = BoxStream<'static, Result<Bytes>>;

/// Stream of plain output bytes from a one-shot exec.
pub type OutputStream = BoxStream<'static, Result<Bytes>>;

/// Stream of container lifecycle events.
pub type EventStream = BoxStream<'static, Result<RuntimeEvent>>;

/// A running container as reported by the runtime.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub server_id: Option<String>,
    pub labels: HashMap<String, String>,
}

/// One-shot resource counters for a container, in the runtime's native
/// units. CPU counters are cumulative; `pre_*` values are the runtime's
/// previous observation.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub cpu_total: u64,
    pub cpu_system: u64,
    pub pre_cpu_total: u64,
    pub pre_cpu_system: u64,
    pub online_cpus: u32,
    pub mem_usage_bytes: u64,
    pub storage_write_bytes: Option<u64>,
    pub networks: Vec<NetworkStats>,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    /// RFC3339 start time, when the runtime reports one.
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Die,
    Stop,
}

/// A container lifecycle event with the runtime's actor attributes.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub action: EventAction,
    pub container_id: String,
    pub attributes: HashMap<String, String>,
}

impl RuntimeEvent {
    pub fn server_id(&self) -> Option<&str> {
        self.attributes.get(SERVER_ID_LABEL).map(String::as_str)
    }

    pub fn exit_code(&self) -> Option<&str> {
        self.attributes.get("exitCode").map(String::as_str)
    }
}

/// Container runtime operations the agent depends on.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Running containers only.
    async fn list_running(&self) -> Result<Vec<ContainerSummary>>;

    /// A single (non-streaming) stats read.
    async fn stats_once(&self, container_id: &str) -> Result<StatsSnapshot>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerDetails>;

    async fn start(&self, container_id: &str) -> Result<()>;

    /// SIGTERM, wait up to 30 s, then SIGKILL.
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Stop (30 s grace) followed by start, as one runtime call.
    async fn restart(&self, container_id: &str) -> Result<()>;

    async fn kill(&self, container_id: &str) -> Result<()>;

    /// Follow the container's multiplexed log stream; each item is one
    /// whole frame (header plus payload).
    async fn logs_follow(&self, container_id: &str) -> Result<FrameStream>;

    /// One-shot tail of the last `lines` log lines, demultiplexed to text.
    async fn logs_tail(&self, container_id: &str, lines: usize) -> Result<String>;

    /// Run `cmd` inside the container and stream its combined
    /// stdout/stderr output.
    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<OutputStream>;

    /// Subscribe to `start`/`die`/`stop` container events. The stream may
    /// yield errors or end; callers are expected to back off and
    /// resubscribe.
    async fn events(&self) -> EventStream;
}

/// Build a multiplexed frame from a stream marker and payload.
pub fn encode_frame(marker: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u8(marker);
    frame.put_bytes(0, 3);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

/// Collect an exec output stream into a lossy UTF-8 string.
pub async fn collect_output(mut output: OutputStream) -> Result<String> {
    use futures::StreamExt;

    let mut collected = String::new();
    while let Some(chunk) = output.next().await {
        collected.push_str(&String::from_utf8_lossy(&chunk?));
    }
    Ok(collected)
}
