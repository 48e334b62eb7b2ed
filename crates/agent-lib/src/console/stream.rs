//! Per-workload console stream: one log follow fanned out to many
//! subscribers, with a bounded replay buffer and command injection.
//!
//! Each subscriber owns a bounded queue; a subscriber whose queue is full
//! or closed at broadcast time is detached so it can never stall the
//! others. Broadcast takes the subscriber read lock and then the replay
//! lock; join takes the subscriber write lock and then the replay lock,
//! so a joining subscriber sees exactly the replay prefix followed by
//! every later live entry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::{CommandMessage, LogEntry, LogKind};
use crate::observability::AgentMetrics;
use crate::runtime::{FrameStream, OutputStream, Runtime, FRAME_HEADER_LEN, FRAME_STDERR};

/// Most-recent log entries kept for replay to new subscribers.
pub const REPLAY_BUFFER_LINES: usize = 100;

/// Per-subscriber queue depth. Replay seeding uses at most
/// [`REPLAY_BUFFER_LINES`] slots, leaving headroom before backpressure
/// detaches a subscriber.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Stopping,
    Stopped,
}

pub type SubscriberId = u64;

pub struct ConsoleStream {
    server_id: String,
    container_id: String,
    runtime: Arc<dyn Runtime>,
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<LogEntry>>>,
    replay: Mutex<VecDeque<LogEntry>>,
    state: Mutex<StreamState>,
    follow_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
    next_subscriber: AtomicU64,
    metrics: AgentMetrics,
}

impl ConsoleStream {
    pub fn new(
        server_id: impl Into<String>,
        container_id: impl Into<String>,
        runtime: Arc<dyn Runtime>,
        metrics: AgentMetrics,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            server_id: server_id.into(),
            container_id: container_id.into(),
            runtime,
            subscribers: RwLock::new(HashMap::new()),
            replay: Mutex::new(VecDeque::new()),
            state: Mutex::new(StreamState::Idle),
            follow_task: Mutex::new(None),
            shutdown,
            next_subscriber: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub async fn state(&self) -> StreamState {
        *self.state.lock().await
    }

    /// Attach to the container's log stream and begin broadcasting. Valid
    /// only once, from `Idle`; a stopped stream is replaced by the
    /// manager, never restarted.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != StreamState::Idle {
                bail!("console stream for {} already started", self.server_id);
            }
            *state = StreamState::Streaming;
        }

        let frames = match self.runtime.logs_follow(&self.container_id).await {
            Ok(frames) => frames,
            Err(e) => {
                *self.state.lock().await = StreamState::Idle;
                return Err(e.context("attach to container logs"));
            }
        };

        info!(server_id = %self.server_id, "starting console stream");

        let shutdown = self.shutdown.subscribe();
        let stream = self.clone();
        let handle = tokio::spawn(async move { stream.follow(frames, shutdown).await });
        *self.follow_task.lock().await = Some(handle);
        Ok(())
    }

    /// Signal the follow task, close every subscriber, and wait for the
    /// task to exit. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().await;
            if matches!(*state, StreamState::Stopping | StreamState::Stopped) {
                return;
            }
            *state = StreamState::Stopping;
        }
        info!(server_id = %self.server_id, "stopping console stream");

        let _ = self.shutdown.send(());

        {
            let mut subscribers = self.subscribers.write().await;
            self.metrics
                .add_console_subscribers(-(subscribers.len() as i64));
            subscribers.clear();
        }

        if let Some(handle) = self.follow_task.lock().await.take() {
            let _ = handle.await;
        }

        *self.state.lock().await = StreamState::Stopped;
    }

    async fn follow(self: Arc<Self>, mut frames: FrameStream, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                item = frames.next() => match item {
                    Some(Ok(frame)) => {
                        if let Some(entry) = parse_frame(&frame) {
                            self.publish(entry).await;
                        }
                    }
                    Some(Err(e)) => {
                        error!(server_id = %self.server_id, error = %e, "error reading container logs");
                        break;
                    }
                    None => {
                        info!(server_id = %self.server_id, "log stream ended");
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Record an entry in the replay buffer and fan it out. Stale
    /// subscribers are removed outside the broadcast critical section.
    async fn publish(&self, entry: LogEntry) {
        let mut stale = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            let mut replay = self.replay.lock().await;
            replay.push_back(entry.clone());
            while replay.len() > REPLAY_BUFFER_LINES {
                replay.pop_front();
            }

            for (id, queue) in subscribers.iter() {
                if queue.try_send(entry.clone()).is_err() {
                    stale.push(*id);
                }
            }
        }

        if !stale.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in stale {
                if subscribers.remove(&id).is_some() {
                    self.metrics.add_console_subscribers(-1);
                    warn!(
                        server_id = %self.server_id,
                        subscriber = id,
                        "detached slow or disconnected console subscriber"
                    );
                }
            }
        }
    }

    /// Join the stream. The returned receiver yields the replay buffer in
    /// order, then live entries observed after the join.
    pub async fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<LogEntry>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);

        let mut subscribers = self.subscribers.write().await;
        let replay = self.replay.lock().await;
        for entry in replay.iter() {
            // Queue depth exceeds the replay bound, so seeding cannot fail.
            let _ = tx.try_send(entry.clone());
        }
        subscribers.insert(id, tx);
        self.metrics.add_console_subscribers(1);

        info!(
            server_id = %self.server_id,
            subscriber = id,
            total = subscribers.len(),
            "console subscriber joined"
        );
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(&id).is_some() {
            self.metrics.add_console_subscribers(-1);
            info!(
                server_id = %self.server_id,
                subscriber = id,
                total = subscribers.len(),
                "console subscriber left"
            );
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Run a subscriber's command as a one-shot exec and stream its output
    /// back to that subscriber only. The command is neither broadcast nor
    /// recorded in the replay buffer.
    pub async fn handle_command(&self, subscriber: SubscriberId, raw: &str) -> Result<()> {
        let message: CommandMessage =
            serde_json::from_str(raw).context("invalid command format")?;
        if message.kind != "command" {
            bail!("unknown message type: {}", message.kind);
        }

        let queue = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .get(&subscriber)
                .cloned()
                .context("unknown subscriber")?
        };

        info!(
            server_id = %self.server_id,
            command = %message.command,
            "executing console command"
        );

        let output = self
            .runtime
            .exec(
                &self.container_id,
                vec!["/bin/sh".to_string(), "-c".to_string(), message.command],
            )
            .await
            .context("start exec")?;

        tokio::spawn(forward_exec_output(output, queue));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn replay_len(&self) -> usize {
        self.replay.lock().await.len()
    }
}

/// Forward exec output to one subscriber, line by line.
async fn forward_exec_output(mut output: OutputStream, queue: mpsc::Sender<LogEntry>) {
    let mut pending = String::new();
    while let Some(item) = output.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(error = %e, "error reading exec output");
                break;
            }
        };
        pending.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = pending.find('\n') {
            let line = pending[..newline].trim_end_matches('\r').to_string();
            let rest = pending[newline + 1..].to_string();
            pending = rest;
            if queue.send(LogEntry::new(LogKind::Stdout, line)).await.is_err() {
                return;
            }
        }
    }

    if !pending.is_empty() {
        let _ = queue.send(LogEntry::new(LogKind::Stdout, pending)).await;
    }
}

/// Demultiplex one frame: 8-byte header whose first byte distinguishes
/// stdout from stderr, then the payload. Frames shorter than 9 bytes are
/// dropped.
pub(crate) fn parse_frame(frame: &[u8]) -> Option<LogEntry> {
    if frame.len() <= FRAME_HEADER_LEN {
        return None;
    }

    let kind = if frame[0] == FRAME_STDERR {
        LogKind::Stderr
    } else {
        LogKind::Stdout
    };

    let line = String::from_utf8_lossy(&frame[FRAME_HEADER_LEN..])
        .trim_end_matches(['\r', '\n'])
        .to_string();
    Some(LogEntry::new(kind, line))
}
