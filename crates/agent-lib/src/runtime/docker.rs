//! Docker-backed [`Runtime`] implementation using bollard.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::query_parameters::{
    EventsOptionsBuilder, InspectContainerOptions, KillContainerOptionsBuilder,
    ListContainersOptionsBuilder, LogsOptionsBuilder, RestartContainerOptionsBuilder,
    StartContainerOptions, StatsOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use super::{
    encode_frame, ContainerDetails, ContainerSummary, EventAction, EventStream, FrameStream,
    NetworkStats, OutputStream, Runtime, RuntimeEvent, StatsSnapshot, FRAME_STDERR, FRAME_STDOUT,
    SERVER_ID_LABEL,
};

/// Grace period for stop/restart before the runtime escalates to SIGKILL.
const STOP_TIMEOUT_SECS: i32 = 30;

/// How many historical lines a log follow starts with. The console stream
/// keeps its own replay buffer on top of this.
const FOLLOW_TAIL_LINES: &str = "100";

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using the environment defaults.
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("connect to docker daemon")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptionsBuilder::new().all(false).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("list containers")?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let labels = c.labels.unwrap_or_default();
                let server_id = labels.get(SERVER_ID_LABEL).cloned();
                Some(ContainerSummary {
                    id,
                    server_id,
                    labels,
                })
            })
            .collect())
    }

    async fn stats_once(&self, container_id: &str) -> Result<StatsSnapshot> {
        let options = StatsOptionsBuilder::new().stream(false).build();
        let mut stats_stream = Box::pin(self.docker.stats(container_id, Some(options)));
        let stats = stats_stream
            .next()
            .await
            .context("stats stream ended without a sample")?
            .context("read container stats")?;

        let cpu = stats.cpu_stats.unwrap_or_default();
        let pre_cpu = stats.precpu_stats.unwrap_or_default();
        let memory = stats.memory_stats.unwrap_or_default();

        let networks = stats
            .networks
            .unwrap_or_default()
            .into_values()
            .map(|n| NetworkStats {
                tx_bytes: n.tx_bytes.unwrap_or(0),
            })
            .collect();

        Ok(StatsSnapshot {
            cpu_total: cpu.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0),
            cpu_system: cpu.system_cpu_usage.unwrap_or(0),
            pre_cpu_total: pre_cpu
                .cpu_usage
                .as_ref()
                .and_then(|u| u.total_usage)
                .unwrap_or(0),
            pre_cpu_system: pre_cpu.system_cpu_usage.unwrap_or(0),
            online_cpus: cpu.online_cpus.unwrap_or(0),
            mem_usage_bytes: memory.usage.unwrap_or(0),
            storage_write_bytes: stats
                .storage_stats
                .and_then(|s| s.write_size_bytes),
            networks,
        })
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerDetails> {
        let details = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .context("inspect container")?;

        Ok(ContainerDetails {
            started_at: details.state.and_then(|s| s.started_at),
        })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .context("start container")
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptionsBuilder::new().t(STOP_TIMEOUT_SECS).build();
        self.docker
            .stop_container(container_id, Some(options))
            .await
            .context("stop container")
    }

    async fn restart(&self, container_id: &str) -> Result<()> {
        let options = RestartContainerOptionsBuilder::new()
            .t(STOP_TIMEOUT_SECS)
            .build();
        self.docker
            .restart_container(container_id, Some(options))
            .await
            .context("restart container")
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        let options = KillContainerOptionsBuilder::new().signal("SIGKILL").build();
        self.docker
            .kill_container(container_id, Some(options))
            .await
            .context("kill container")
    }

    async fn logs_follow(&self, container_id: &str) -> Result<FrameStream> {
        let options = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .tail(FOLLOW_TAIL_LINES)
            .build();

        // bollard demultiplexes for us; rebuild the documented frame shape
        // so console parsing has one contract for every runtime.
        let frames = self.docker.logs(container_id, Some(options)).map(|item| {
            item.map(|output| match output {
                LogOutput::StdErr { message } => encode_frame(FRAME_STDERR, &message),
                LogOutput::StdOut { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => encode_frame(FRAME_STDOUT, &message),
            })
            .map_err(Into::into)
        });

        Ok(Box::pin(frames))
    }

    async fn logs_tail(&self, container_id: &str, lines: usize) -> Result<String> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&lines.to_string())
            .build();

        let mut stream = Box::pin(self.docker.logs(container_id, Some(options)));
        let mut collected = String::new();
        while let Some(item) = stream.next().await {
            let output = item.context("read container logs")?;
            collected.push_str(&String::from_utf8_lossy(&output.into_bytes()));
        }
        Ok(collected)
    }

    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<OutputStream> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await
            .context("create exec")?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("start exec")?
        {
            StartExecResults::Attached { output, .. } => Ok(Box::pin(
                output.map(|item| item.map(|out| out.into_bytes()).map_err(Into::into)),
            )),
            StartExecResults::Detached => Ok(Box::pin(futures::stream::empty())),
        }
    }

    async fn events(&self) -> EventStream {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["die".to_string(), "stop".to_string(), "start".to_string()],
        );
        let options = EventsOptionsBuilder::new().filters(&filters).build();

        let events = self.docker.events(Some(options)).filter_map(|item| async {
            match item {
                Ok(message) => {
                    let action = match message.action.as_deref() {
                        Some("start") => EventAction::Start,
                        Some("die") => EventAction::Die,
                        Some("stop") => EventAction::Stop,
                        other => {
                            debug!(action = ?other, "ignoring unexpected container event");
                            return None;
                        }
                    };
                    let actor = message.actor?;
                    Some(Ok(RuntimeEvent {
                        action,
                        container_id: actor.id.unwrap_or_default(),
                        attributes: actor.attributes.unwrap_or_default(),
                    }))
                }
                Err(e) => Some(Err(e.into())),
            }
        });

        Box::pin(events)
    }
}
