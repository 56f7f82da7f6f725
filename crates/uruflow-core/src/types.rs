//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use uruflow_protocol::message::{ContainerMetrics, SystemMetrics};

/// Unique identifier for a worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Create a new worker ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection status of a worker as recorded in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Online => write!(f, "online"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Lifecycle of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployStatus::Pending => write!(f, "pending"),
            DeployStatus::Running => write!(f, "running"),
            DeployStatus::Success => write!(f, "success"),
            DeployStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A worker record as persisted by the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    /// Peer address observed by the coordinator
    pub host: String,
    /// Hostname reported by the worker at handshake
    pub hostname: String,
    /// Worker software version
    pub version: String,
    pub status: WorkerStatus,
    /// Epoch millis of the last liveness signal
    pub last_heartbeat: u64,
    /// Epoch millis of first registration
    pub registered_at: u64,
    pub metrics: Option<WorkerMetrics>,
}

/// Host metrics persisted per worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_percent: f64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub load_avg: [f64; 3],
    pub uptime: i64,
}

impl From<&SystemMetrics> for WorkerMetrics {
    fn from(m: &SystemMetrics) -> Self {
        Self {
            cpu_percent: m.cpu_percent,
            memory_percent: m.memory_percent,
            memory_used: m.memory_used,
            memory_total: m.memory_total,
            disk_percent: m.disk_percent,
            disk_used: m.disk_used,
            disk_total: m.disk_total,
            load_avg: m.load_avg,
            uptime: m.uptime,
        }
    }
}

/// A container record persisted per worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub worker_id: WorkerId,
    pub name: String,
    pub image: String,
    pub status: String,
    pub health: String,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub restart_count: i64,
    /// Epoch seconds, 0 when never started
    pub started_at: i64,
}

impl ContainerRecord {
    /// Build a record from wire metrics for the given worker
    pub fn from_metrics(worker_id: &WorkerId, m: &ContainerMetrics) -> Self {
        Self {
            id: m.id.clone(),
            worker_id: worker_id.clone(),
            name: m.name.clone(),
            image: m.image.clone(),
            status: m.status.clone(),
            health: m.health.clone(),
            cpu_percent: m.cpu_percent,
            memory_usage: m.memory_usage,
            memory_limit: m.memory_limit,
            network_rx: m.network_rx,
            network_tx: m.network_tx,
            restart_count: m.restart_count,
            started_at: m.started_at,
        }
    }
}

/// A repository the coordinator can deploy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub worker_id: WorkerId,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub auto_deploy: bool,
    #[serde(default)]
    pub build_system: String,
    #[serde(default)]
    pub build_file: String,
    #[serde(default)]
    pub build_cmd: String,
}

/// A deployment record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub repository: String,
    pub branch: String,
    pub commit: String,
    pub worker_id: WorkerId,
    pub worker_name: String,
    pub status: DeployStatus,
    /// Final output or failure reason
    #[serde(default)]
    pub output: String,
    /// Milliseconds, 0 until resolved
    #[serde(default)]
    pub duration: i64,
    /// Epoch millis
    pub started_at: u64,
    /// Epoch millis, set when resolved
    pub ended_at: Option<u64>,
    /// What initiated the deployment ("webhook", "manual", ...)
    pub trigger: String,
}

/// One line of deployment output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentLog {
    pub deployment_id: String,
    pub line: String,
    /// "stdout" or "stderr"
    pub stream: String,
    /// Epoch seconds
    pub timestamp: i64,
}

/// An alert raised by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub worker_id: WorkerId,
    pub worker_name: String,
    /// Alert kind ("high_cpu", "agent_offline", ...)
    pub kind: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub resolved: bool,
    /// Epoch millis
    pub created_at: u64,
    pub resolved_at: Option<u64>,
}
