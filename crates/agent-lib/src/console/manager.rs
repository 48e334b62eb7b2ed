//! Interns one console stream per workload.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::info;

use super::stream::ConsoleStream;
use crate::observability::AgentMetrics;
use crate::runtime::Runtime;

pub struct StreamManager {
    runtime: Arc<dyn Runtime>,
    streams: Mutex<HashMap<String, Arc<ConsoleStream>>>,
    metrics: AgentMetrics,
}

impl StreamManager {
    pub fn new(runtime: Arc<dyn Runtime>, metrics: AgentMetrics) -> Self {
        Self {
            runtime,
            streams: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Return the workload's stream, creating and starting one if absent.
    /// The map lock is held across construction and `start()`, so
    /// concurrent calls for the same key start at most one stream.
    pub async fn get_or_create(
        &self,
        server_id: &str,
        container_id: &str,
    ) -> Result<Arc<ConsoleStream>> {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get(server_id) {
            return Ok(stream.clone());
        }

        let stream = Arc::new(ConsoleStream::new(
            server_id,
            container_id,
            self.runtime.clone(),
            self.metrics.clone(),
        ));
        stream.clone().start().await?;
        streams.insert(server_id.to_string(), stream.clone());
        self.metrics.set_console_streams(streams.len() as i64);
        info!(server_id = %server_id, "created console stream");
        Ok(stream)
    }

    pub async fn get(&self, server_id: &str) -> Option<Arc<ConsoleStream>> {
        self.streams.lock().await.get(server_id).cloned()
    }

    /// Stop and forget the workload's stream.
    pub async fn remove(&self, server_id: &str) {
        let removed = {
            let mut streams = self.streams.lock().await;
            let removed = streams.remove(server_id);
            self.metrics.set_console_streams(streams.len() as i64);
            removed
        };
        if let Some(stream) = removed {
            stream.stop().await;
            info!(server_id = %server_id, "removed console stream");
        }
    }

    /// Stop every stream. Used during agent shutdown.
    pub async fn shutdown(&self) {
        let streams: Vec<Arc<ConsoleStream>> = {
            let mut map = self.streams.lock().await;
            let streams = map.drain().map(|(_, stream)| stream).collect();
            self.metrics.set_console_streams(0);
            streams
        };
        for stream in streams {
            stream.stop().await;
        }
        info!("all console streams stopped");
    }
}
