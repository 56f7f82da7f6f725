//! Deployment service
//!
//! Entry point used by the webhook ingress and operator tooling: creates a
//! `Pending` deployment and dispatches the matching deploy command over the
//! registry.

use std::sync::Arc;

use thiserror::Error;

use uruflow_core::id::generate_id;
use uruflow_core::time::now_millis;
use uruflow_core::types::{DeployStatus, Deployment, WorkerId};
use uruflow_core::StoreError;
use uruflow_protocol::message::CommandPayload;

use crate::server::{CoordinatorServer, SendError};

/// Deployment trigger failures
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("worker {0} is not connected")]
    WorkerNotConnected(WorkerId),

    #[error("repository {0} is not configured")]
    UnknownRepository(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("command dispatch failed: {0}")]
    Send(#[from] SendError),
}

/// Creates deployments and dispatches their commands
pub struct DeploymentService {
    server: Arc<CoordinatorServer>,
}

impl DeploymentService {
    pub fn new(server: Arc<CoordinatorServer>) -> Self {
        Self { server }
    }

    /// Create a `Pending` deployment for the repository and send the deploy
    /// command to the worker. On dispatch failure the deployment is marked
    /// `Failed` with the error captured as its output.
    pub async fn trigger_deploy(
        &self,
        worker_id: &WorkerId,
        repo_name: &str,
        branch: &str,
        commit: &str,
        trigger: &str,
    ) -> Result<Deployment, TriggerError> {
        if !self.server.is_worker_connected(worker_id) {
            tracing::warn!("deploy requested for offline worker {}", worker_id);
            return Err(TriggerError::WorkerNotConnected(worker_id.clone()));
        }

        let repo = self
            .server
            .config()
            .repository(repo_name)
            .ok_or_else(|| TriggerError::UnknownRepository(repo_name.to_string()))?
            .clone();

        let store = self.server.store();
        let worker_name = store
            .get_worker(worker_id)
            .await
            .ok()
            .flatten()
            .map(|w| w.name)
            .unwrap_or_else(|| "unknown".to_string());

        let branch = if branch.is_empty() { repo.branch.as_str() } else { branch };

        let mut deployment = Deployment {
            id: generate_id(),
            repository: repo_name.to_string(),
            branch: branch.to_string(),
            commit: commit.to_string(),
            worker_id: worker_id.clone(),
            worker_name,
            status: DeployStatus::Pending,
            output: String::new(),
            duration: 0,
            started_at: now_millis(),
            ended_at: None,
            trigger: trigger.to_string(),
        };

        tracing::info!(
            "creating deployment {} (repo={} branch={} worker={} trigger={})",
            deployment.id,
            repo_name,
            branch,
            worker_id,
            trigger
        );

        store.create_deployment(deployment.clone()).await?;

        let command = CommandPayload {
            id: deployment.id.clone(),
            command_type: "deploy".to_string(),
            payload: serde_json::json!({
                "url": repo.url,
                "name": repo.name,
                "branch": branch,
                "commit": commit,
                "path": repo.path,
                "build_system": repo.build_system,
                "build_file": repo.build_file,
                "build_cmd": repo.build_cmd,
            }),
        };

        if let Err(e) = self.server.send_command(worker_id, &command).await {
            tracing::error!("deploy command to {} failed: {}", worker_id, e);

            deployment.status = DeployStatus::Failed;
            deployment.output = format!("failed to send command: {e}");
            deployment.ended_at = Some(deployment.started_at);
            if let Err(update_err) = store.update_deployment(deployment).await {
                tracing::error!("deployment failure update failed: {}", update_err);
            }

            return Err(e.into());
        }

        tracing::info!("deploy command sent: deployment_id={}", deployment.id);
        Ok(deployment)
    }
}
