//! Container runtime integration
//!
//! Lists containers, reads stats, and tails logs through the docker API.
//! Managed detection follows the deploy conventions: the
//! `io.uruflow.managed=true` label, or a compose project named `uruflow-*`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::query_parameters::{
    InspectContainerOptions, ListContainersOptionsBuilder, LogsOptionsBuilder, StatsOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Label marking containers deployed by the worker
pub const MANAGED_LABEL: &str = "io.uruflow.managed";

/// Compose project label set by docker compose
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Compose project prefix used by the deploy executor
pub const COMPOSE_PROJECT_PREFIX: &str = "uruflow-";

/// Prefix marking stderr lines in a mixed log stream
pub const STDERR_PREFIX: &str = "[stderr] ";

/// Docker API failures
#[derive(Error, Debug)]
pub enum DockerError {
    #[error("docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
}

/// A container as seen by the metrics push
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    /// Short (12-character) container ID
    pub id: String,
    pub name: String,
    pub image: String,
    /// Lifecycle state ("running", "exited", ...)
    pub state: String,
    /// Health check status, "none" when no check is defined
    pub health: String,
    pub restart_count: i64,
    /// Epoch seconds, 0 when never started
    pub started_at: i64,
    pub managed: bool,
}

/// Point-in-time resource usage for a running container
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
}

/// Whether a label set marks a container as managed
pub fn is_managed(labels: &HashMap<String, String>) -> bool {
    if labels.get(MANAGED_LABEL).map(String::as_str) == Some("true") {
        return true;
    }
    labels
        .get(COMPOSE_PROJECT_LABEL)
        .map(|project| project.starts_with(COMPOSE_PROJECT_PREFIX))
        .unwrap_or(false)
}

/// Narrow container interface consumed by the worker session
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers, including stopped ones
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError>;

    /// Resource usage for one running container
    async fn container_stats(&self, container_id: &str) -> Result<ContainerStats, DockerError>;

    /// Tail a container's logs onto `lines`: the last `tail` lines, then
    /// follow when requested. Stderr lines carry the [`STDERR_PREFIX`]
    /// sentinel. Returns when the stream ends or `cancel` fires.
    async fn stream_logs(
        &self,
        container_id: &str,
        tail: u32,
        follow: bool,
        lines: UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<(), DockerError>;
}

/// Container runtime backed by the docker socket
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect and verify the daemon is reachable
    pub async fn connect(socket: &Path) -> Result<Self, DockerError> {
        let client =
            Docker::connect_with_socket(&socket.to_string_lossy(), 30, API_DEFAULT_VERSION)?;
        client.ping().await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        let options = ListContainersOptionsBuilder::new().all(true).build();
        let containers = self.client.list_containers(Some(options)).await?;

        let mut result = Vec::with_capacity(containers.len());
        for c in containers {
            let full_id = c.id.unwrap_or_default();
            let name = c
                .names
                .unwrap_or_default()
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let managed = c.labels.map(|labels| is_managed(&labels)).unwrap_or(false);

            let mut summary = ContainerSummary {
                id: full_id.chars().take(12).collect(),
                name,
                image: c.image.unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                health: "none".to_string(),
                restart_count: 0,
                started_at: 0,
                managed,
            };

            // Health, restart count, and start time only show up in inspect
            if let Ok(inspect) = self
                .client
                .inspect_container(&full_id, None::<InspectContainerOptions>)
                .await
            {
                summary.restart_count = inspect.restart_count.unwrap_or(0);
                if let Some(state) = inspect.state {
                    if let Some(health) = state.health.and_then(|h| h.status) {
                        summary.health = health.to_string();
                    }
                    if let Some(started) = state.started_at {
                        summary.started_at = chrono::DateTime::parse_from_rfc3339(&started)
                            .map(|t| t.timestamp())
                            .unwrap_or(0);
                    }
                }
            }

            result.push(summary);
        }

        Ok(result)
    }

    async fn container_stats(&self, container_id: &str) -> Result<ContainerStats, DockerError> {
        let options = StatsOptionsBuilder::new().stream(false).build();
        let mut stream = self.client.stats(container_id, Some(options));

        let Some(stats) = stream.next().await.transpose()? else {
            return Ok(ContainerStats::default());
        };

        let mut result = ContainerStats::default();

        // CPU percent from the usage delta against the previous sample
        if let (Some(cpu), Some(precpu)) = (stats.cpu_stats, stats.precpu_stats) {
            let total = cpu
                .cpu_usage
                .as_ref()
                .and_then(|u| u.total_usage)
                .unwrap_or(0);
            let pre_total = precpu
                .cpu_usage
                .as_ref()
                .and_then(|u| u.total_usage)
                .unwrap_or(0);
            let system = cpu.system_cpu_usage.unwrap_or(0);
            let pre_system = precpu.system_cpu_usage.unwrap_or(0);

            let cpu_delta = total.saturating_sub(pre_total) as f64;
            let system_delta = system.saturating_sub(pre_system) as f64;
            if cpu_delta > 0.0 && system_delta > 0.0 {
                let online = cpu.online_cpus.unwrap_or(1) as f64;
                result.cpu_percent = cpu_delta / system_delta * online * 100.0;
            }
        }

        if let Some(memory) = stats.memory_stats {
            result.memory_usage = memory.usage.unwrap_or(0);
            result.memory_limit = memory.limit.unwrap_or(0);
        }

        for net in stats.networks.unwrap_or_default().values() {
            result.network_rx += net.rx_bytes.unwrap_or(0);
            result.network_tx += net.tx_bytes.unwrap_or(0);
        }

        Ok(result)
    }

    async fn stream_logs(
        &self,
        container_id: &str,
        tail: u32,
        follow: bool,
        lines: UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<(), DockerError> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .follow(follow)
            .tail(&tail.to_string())
            .build();

        let mut stream = self.client.logs(container_id, Some(options));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                item = stream.next() => match item {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(output)) => {
                        let (stderr, message) = match output {
                            bollard::container::LogOutput::StdErr { message } => (true, message),
                            bollard::container::LogOutput::StdOut { message } => (false, message),
                            _ => continue,
                        };
                        let text = String::from_utf8_lossy(&message);
                        let line = text.trim_end_matches(['\r', '\n']).trim();
                        if line.is_empty() {
                            continue;
                        }
                        let line = if stderr {
                            format!("{STDERR_PREFIX}{line}")
                        } else {
                            line.to_string()
                        };
                        if lines.send(line).is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
