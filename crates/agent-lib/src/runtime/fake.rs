//! Scripted in-memory [`Runtime`] for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    encode_frame, ContainerDetails, ContainerSummary, EventStream, FrameStream, OutputStream,
    Runtime, RuntimeEvent, StatsSnapshot, SERVER_ID_LABEL,
};

/// Deterministic runtime: tests push events and log frames, script stats
/// and exec output, and inspect the calls the subsystems made.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<ContainerSummary>>,
    stats: Mutex<HashMap<String, StatsSnapshot>>,
    details: Mutex<HashMap<String, ContainerDetails>>,
    fail_restarts: AtomicBool,

    restart_calls: Mutex<Vec<(String, Instant)>>,
    exec_calls: Mutex<Vec<(String, Vec<String>)>>,
    exec_output: Mutex<Vec<String>>,
    follow_count: AtomicUsize,

    event_senders: Mutex<Vec<mpsc::UnboundedSender<Result<RuntimeEvent>>>>,
    log_senders: Mutex<HashMap<String, mpsc::UnboundedSender<Result<Bytes>>>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, id: &str, server_id: Option<&str>) {
        let mut labels = HashMap::new();
        if let Some(server_id) = server_id {
            labels.insert(SERVER_ID_LABEL.to_string(), server_id.to_string());
        }
        self.containers.lock().unwrap().push(ContainerSummary {
            id: id.to_string(),
            server_id: server_id.map(str::to_string),
            labels,
        });
    }

    pub fn set_stats(&self, id: &str, stats: StatsSnapshot) {
        self.stats.lock().unwrap().insert(id.to_string(), stats);
    }

    pub fn set_details(&self, id: &str, details: ContainerDetails) {
        self.details.lock().unwrap().insert(id.to_string(), details);
    }

    pub fn set_exec_output(&self, lines: Vec<&str>) {
        *self.exec_output.lock().unwrap() = lines.into_iter().map(str::to_string).collect();
    }

    pub fn fail_restarts(&self, fail: bool) {
        self.fail_restarts.store(fail, Ordering::SeqCst);
    }

    pub fn restart_calls(&self) -> Vec<(String, Instant)> {
        self.restart_calls.lock().unwrap().clone()
    }

    pub fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.exec_calls.lock().unwrap().clone()
    }

    pub fn follow_count(&self) -> usize {
        self.follow_count.load(Ordering::SeqCst)
    }

    /// Deliver an event to the most recent `events()` subscription.
    pub fn emit_event(&self, event: RuntimeEvent) {
        let senders = self.event_senders.lock().unwrap();
        let sender = senders.last().expect("no event subscription");
        sender.send(Ok(event)).expect("event subscription dropped");
    }

    /// Deliver a transient error on the most recent `events()` subscription.
    pub fn emit_event_error(&self, message: &str) {
        let senders = self.event_senders.lock().unwrap();
        let sender = senders.last().expect("no event subscription");
        sender
            .send(Err(anyhow!("{message}")))
            .expect("event subscription dropped");
    }

    pub fn event_subscriptions(&self) -> usize {
        self.event_senders.lock().unwrap().len()
    }

    /// Push a framed log line onto the container's follow stream.
    pub fn push_log_frame(&self, container_id: &str, marker: u8, line: &str) {
        let senders = self.log_senders.lock().unwrap();
        let sender = senders
            .get(container_id)
            .expect("no log follow for container");
        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');
        sender
            .send(Ok(encode_frame(marker, &payload)))
            .expect("log follow dropped");
    }

    /// Push raw bytes (possibly a malformed frame) onto the follow stream.
    pub fn push_raw_frame(&self, container_id: &str, frame: Bytes) {
        let senders = self.log_senders.lock().unwrap();
        let sender = senders
            .get(container_id)
            .expect("no log follow for container");
        sender.send(Ok(frame)).expect("log follow dropped");
    }

    fn channel_stream<T: Send + 'static>(
        mut rx: mpsc::UnboundedReceiver<T>,
    ) -> futures::stream::BoxStream<'static, T> {
        Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn stats_once(&self, container_id: &str) -> Result<StatsSnapshot> {
        self.stats
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .ok_or_else(|| anyhow!("no stats scripted for {container_id}"))
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerDetails> {
        Ok(self
            .details
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn start(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn restart(&self, container_id: &str) -> Result<()> {
        self.restart_calls
            .lock()
            .unwrap()
            .push((container_id.to_string(), Instant::now()));
        if self.fail_restarts.load(Ordering::SeqCst) {
            bail!("no such container: {container_id}");
        }
        Ok(())
    }

    async fn kill(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn logs_follow(&self, container_id: &str) -> Result<FrameStream> {
        self.follow_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.log_senders
            .lock()
            .unwrap()
            .insert(container_id.to_string(), tx);
        Ok(Self::channel_stream(rx))
    }

    async fn logs_tail(&self, _container_id: &str, _lines: usize) -> Result<String> {
        Ok(self.exec_output.lock().unwrap().join("\n"))
    }

    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<OutputStream> {
        self.exec_calls
            .lock()
            .unwrap()
            .push((container_id.to_string(), cmd));
        let chunks: Vec<Result<Bytes>> = self
            .exec_output
            .lock()
            .unwrap()
            .iter()
            .map(|line| Ok(Bytes::from(format!("{line}\n"))))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn events(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_senders.lock().unwrap().push(tx);
        Self::channel_stream(rx)
    }
}

/// Build a die/stop/start event carrying the workload label.
pub fn workload_event(
    action: super::EventAction,
    container_id: &str,
    server_id: &str,
    exit_code: Option<&str>,
) -> RuntimeEvent {
    let mut attributes = HashMap::new();
    attributes.insert(SERVER_ID_LABEL.to_string(), server_id.to_string());
    if let Some(code) = exit_code {
        attributes.insert("exitCode".to_string(), code.to_string());
    }
    RuntimeEvent {
        action,
        container_id: container_id.to_string(),
        attributes,
    }
}
