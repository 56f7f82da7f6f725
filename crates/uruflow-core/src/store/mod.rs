//! Storage interface
//!
//! The coordination plane persists worker presence, metrics, containers,
//! deployments, and alerts through this narrow trait. Durable backends are
//! external collaborators; the bundled [`MemoryStore`] backs tests and
//! single-process deployments.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{
    Alert, ContainerRecord, Deployment, DeploymentLog, Worker, WorkerId, WorkerMetrics,
    WorkerStatus,
};

/// Narrow persistence interface consumed by the coordination plane
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a worker record. `registered_at` of an existing
    /// record is preserved.
    async fn upsert_worker(&self, worker: Worker) -> Result<(), StoreError>;

    /// Update a worker's connection status
    async fn set_worker_status(&self, id: &WorkerId, status: WorkerStatus)
        -> Result<(), StoreError>;

    /// Replace a worker's metrics and refresh its heartbeat
    async fn update_worker_metrics(
        &self,
        id: &WorkerId,
        metrics: WorkerMetrics,
    ) -> Result<(), StoreError>;

    /// Fetch a worker record
    async fn get_worker(&self, id: &WorkerId) -> Result<Option<Worker>, StoreError>;

    /// Insert or update a container record, keyed by (worker, container)
    async fn upsert_container(&self, container: ContainerRecord) -> Result<(), StoreError>;

    /// All container records for a worker
    async fn get_containers(&self, id: &WorkerId) -> Result<Vec<ContainerRecord>, StoreError>;

    /// All currently unresolved alerts
    async fn get_active_alerts(&self) -> Result<Vec<Alert>, StoreError>;

    /// Record a new alert
    async fn create_alert(&self, alert: Alert) -> Result<(), StoreError>;

    /// Record a new deployment
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError>;

    /// Fetch a deployment by ID
    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError>;

    /// Replace a deployment record
    async fn update_deployment(&self, deployment: Deployment) -> Result<(), StoreError>;

    /// Append one line of deployment output
    async fn append_deployment_log(&self, log: DeploymentLog) -> Result<(), StoreError>;

    /// All log lines recorded for a deployment, in append order
    async fn get_deployment_logs(&self, id: &str) -> Result<Vec<DeploymentLog>, StoreError>;
}
