//! In-memory store implementation

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StoreError;
use crate::time::now_millis;
use crate::types::{
    Alert, ContainerRecord, Deployment, DeploymentLog, Worker, WorkerId, WorkerMetrics,
    WorkerStatus,
};

use super::Store;

#[derive(Default)]
struct Inner {
    workers: HashMap<WorkerId, Worker>,
    containers: HashMap<(WorkerId, String), ContainerRecord>,
    alerts: Vec<Alert>,
    deployments: HashMap<String, Deployment>,
    deployment_logs: HashMap<String, Vec<DeploymentLog>>,
}

/// Concurrency-safe in-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("store lock poisoned")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("store lock poisoned")
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_worker(&self, mut worker: Worker) -> Result<(), StoreError> {
        let mut inner = self.write();
        if let Some(existing) = inner.workers.get(&worker.id) {
            worker.registered_at = existing.registered_at;
            if worker.metrics.is_none() {
                worker.metrics = existing.metrics.clone();
            }
        }
        inner.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn set_worker_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.write();
        if let Some(worker) = inner.workers.get_mut(id) {
            worker.status = status;
            if status == WorkerStatus::Online {
                worker.last_heartbeat = now_millis();
            }
        }
        Ok(())
    }

    async fn update_worker_metrics(
        &self,
        id: &WorkerId,
        metrics: WorkerMetrics,
    ) -> Result<(), StoreError> {
        let mut inner = self.write();
        if let Some(worker) = inner.workers.get_mut(id) {
            worker.metrics = Some(metrics);
            worker.last_heartbeat = now_millis();
        }
        Ok(())
    }

    async fn get_worker(&self, id: &WorkerId) -> Result<Option<Worker>, StoreError> {
        Ok(self.read().workers.get(id).cloned())
    }

    async fn upsert_container(&self, container: ContainerRecord) -> Result<(), StoreError> {
        let key = (container.worker_id.clone(), container.id.clone());
        self.write().containers.insert(key, container);
        Ok(())
    }

    async fn get_containers(&self, id: &WorkerId) -> Result<Vec<ContainerRecord>, StoreError> {
        Ok(self
            .read()
            .containers
            .values()
            .filter(|c| &c.worker_id == id)
            .cloned()
            .collect())
    }

    async fn get_active_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .read()
            .alerts
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect())
    }

    async fn create_alert(&self, alert: Alert) -> Result<(), StoreError> {
        self.write().alerts.push(alert);
        Ok(())
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        self.write()
            .deployments
            .insert(deployment.id.clone(), deployment);
        Ok(())
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError> {
        Ok(self.read().deployments.get(id).cloned())
    }

    async fn update_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        let mut inner = self.write();
        if !inner.deployments.contains_key(&deployment.id) {
            return Err(StoreError::NotFound(deployment.id));
        }
        inner.deployments.insert(deployment.id.clone(), deployment);
        Ok(())
    }

    async fn append_deployment_log(&self, log: DeploymentLog) -> Result<(), StoreError> {
        self.write()
            .deployment_logs
            .entry(log.deployment_id.clone())
            .or_default()
            .push(log);
        Ok(())
    }

    async fn get_deployment_logs(&self, id: &str) -> Result<Vec<DeploymentLog>, StoreError> {
        Ok(self
            .read()
            .deployment_logs
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertSeverity, DeployStatus};

    fn worker(id: &str) -> Worker {
        Worker {
            id: WorkerId::new(id),
            name: format!("{id}-name"),
            host: "10.0.0.1".to_string(),
            hostname: "build-1".to_string(),
            version: "1.0.0".to_string(),
            status: WorkerStatus::Online,
            last_heartbeat: now_millis(),
            registered_at: 1000,
            metrics: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_preserves_registration_time() {
        let store = MemoryStore::new();
        store.upsert_worker(worker("w1")).await.unwrap();

        let mut updated = worker("w1");
        updated.registered_at = 9999;
        updated.hostname = "build-2".to_string();
        store.upsert_worker(updated).await.unwrap();

        let fetched = store.get_worker(&WorkerId::new("w1")).await.unwrap().unwrap();
        assert_eq!(fetched.registered_at, 1000);
        assert_eq!(fetched.hostname, "build-2");
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let store = MemoryStore::new();
        store.upsert_worker(worker("w1")).await.unwrap();

        store
            .set_worker_status(&WorkerId::new("w1"), WorkerStatus::Offline)
            .await
            .unwrap();

        let fetched = store.get_worker(&WorkerId::new("w1")).await.unwrap().unwrap();
        assert_eq!(fetched.status, WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn test_metrics_update_refreshes_heartbeat() {
        let store = MemoryStore::new();
        let mut w = worker("w1");
        w.last_heartbeat = 0;
        store.upsert_worker(w).await.unwrap();

        store
            .update_worker_metrics(&WorkerId::new("w1"), WorkerMetrics::default())
            .await
            .unwrap();

        let fetched = store.get_worker(&WorkerId::new("w1")).await.unwrap().unwrap();
        assert!(fetched.last_heartbeat > 0);
        assert!(fetched.metrics.is_some());
    }

    #[tokio::test]
    async fn test_container_upsert_is_keyed_per_worker() {
        let store = MemoryStore::new();
        let record = |worker: &str, id: &str, status: &str| ContainerRecord {
            id: id.to_string(),
            worker_id: WorkerId::new(worker),
            name: "api".to_string(),
            image: "api:latest".to_string(),
            status: status.to_string(),
            health: "none".to_string(),
            cpu_percent: 0.0,
            memory_usage: 0,
            memory_limit: 0,
            network_rx: 0,
            network_tx: 0,
            restart_count: 0,
            started_at: 0,
        };

        store.upsert_container(record("w1", "c1", "running")).await.unwrap();
        store.upsert_container(record("w2", "c1", "running")).await.unwrap();
        store.upsert_container(record("w1", "c1", "exited")).await.unwrap();

        let containers = store.get_containers(&WorkerId::new("w1")).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].status, "exited");
    }

    #[tokio::test]
    async fn test_active_alerts_excludes_resolved() {
        let store = MemoryStore::new();
        let alert = |resolved| Alert {
            id: crate::id::generate_id(),
            worker_id: WorkerId::new("w1"),
            worker_name: "prod".to_string(),
            kind: "high_cpu".to_string(),
            message: "CPU usage above 90%".to_string(),
            severity: AlertSeverity::Critical,
            resolved,
            created_at: now_millis(),
            resolved_at: None,
        };

        store.create_alert(alert(false)).await.unwrap();
        store.create_alert(alert(true)).await.unwrap();

        let active = store.get_active_alerts().await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(!active[0].resolved);
    }

    #[tokio::test]
    async fn test_deployment_lifecycle() {
        let store = MemoryStore::new();
        let deployment = Deployment {
            id: "d1".to_string(),
            repository: "api".to_string(),
            branch: "main".to_string(),
            commit: "abc".to_string(),
            worker_id: WorkerId::new("w1"),
            worker_name: "prod".to_string(),
            status: DeployStatus::Pending,
            output: String::new(),
            duration: 0,
            started_at: now_millis(),
            ended_at: None,
            trigger: "manual".to_string(),
        };
        store.create_deployment(deployment.clone()).await.unwrap();

        let mut running = deployment.clone();
        running.status = DeployStatus::Running;
        store.update_deployment(running).await.unwrap();

        let fetched = store.get_deployment("d1").await.unwrap().unwrap();
        assert_eq!(fetched.status, DeployStatus::Running);

        assert!(store.get_deployment("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_deployment_errors() {
        let store = MemoryStore::new();
        let deployment = Deployment {
            id: "ghost".to_string(),
            repository: "api".to_string(),
            branch: "main".to_string(),
            commit: String::new(),
            worker_id: WorkerId::new("w1"),
            worker_name: "prod".to_string(),
            status: DeployStatus::Failed,
            output: String::new(),
            duration: 0,
            started_at: 0,
            ended_at: None,
            trigger: "manual".to_string(),
        };
        assert!(matches!(
            store.update_deployment(deployment).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deployment_logs_append_in_order() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .append_deployment_log(DeploymentLog {
                    deployment_id: "d1".to_string(),
                    line: format!("line {i}"),
                    stream: "stdout".to_string(),
                    timestamp: i,
                })
                .await
                .unwrap();
        }

        let logs = store.get_deployment_logs("d1").await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].line, "line 0");
        assert_eq!(logs[2].line, "line 2");
    }
}
