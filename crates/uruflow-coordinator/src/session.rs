//! Coordinator-side worker session
//!
//! A session is the authenticated, live binding to one worker. It owns the
//! connection, drives the read loop under an idle deadline, and dispatches
//! each inbound frame to a per-kind handler. Worker identity is bound once
//! at handshake and immutable afterwards.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use uruflow_core::config::{CoordinatorConfig, TimeoutsConfig};
use uruflow_core::id::generate_id;
use uruflow_core::time::{millis_since, now_millis, now_secs};
use uruflow_core::types::{
    ContainerRecord, DeployStatus, DeploymentLog, Worker, WorkerId, WorkerMetrics, WorkerStatus,
};
use uruflow_core::{Store, StoreError};
use uruflow_protocol::message::{
    AuthFailPayload, AuthOkPayload, AuthPayload, CommandAckPayload, CommandDonePayload,
    CommandLogPayload, CommandStartPayload, ContainerLogsDataPayload, MetricsPayload,
};
use uruflow_protocol::{Connection, Message, MessageKind, ProtocolError};

use crate::alerts;

/// Callback invoked at most once when a session leaves the registry on its
/// own (read error, idle timeout, liveness breach, peer disconnect). The
/// registry drops the hook when it evicts or removes a session, so eviction
/// never triggers deregistration side effects.
pub type CloseHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Observer callbacks for externally visible events. All optional; invoked
/// inline on the session task, so they must be cheap.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_metrics: Option<Arc<dyn Fn(&WorkerId, &WorkerMetrics) + Send + Sync>>,
    pub on_command_log: Option<Arc<dyn Fn(&WorkerId, &DeploymentLog) + Send + Sync>>,
    pub on_container_log: Option<Arc<dyn Fn(&WorkerId, &ContainerLogsDataPayload) + Send + Sync>>,
    pub on_disconnect: Option<Arc<dyn Fn(&WorkerId) + Send + Sync>>,
}

/// Collaborators a running session needs
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn Store>,
    pub timeouts: TimeoutsConfig,
    pub hooks: Hooks,
}

/// Authentication failure modes
#[derive(Error, Debug)]
pub enum AuthError {
    /// Peer violated the handshake sequence or sent a malformed payload
    #[error("authentication protocol violation: {0}")]
    Protocol(String),

    /// Token was not found in the worker table
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// Transport failed during the handshake
    #[error(transparent)]
    Transport(#[from] ProtocolError),

    /// Store failed while recording presence
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

enum Flow {
    Continue,
    Exit,
}

/// An authenticated coordinator-side session
pub struct Session {
    id: String,
    worker_id: WorkerId,
    worker_name: String,
    conn: Arc<Connection>,
    connected_at: Instant,
    /// Epoch millis of the last liveness signal (PONG or handshake)
    last_pong: AtomicU64,
    cancel: tokio_util::sync::CancellationToken,
    closing: AtomicBool,
    on_close: Mutex<Option<CloseHook>>,
}

impl Session {
    /// Drive the handshake on a fresh connection.
    ///
    /// Receives exactly one frame under the auth deadline, validates the
    /// token against the pre-provisioned worker table, records presence in
    /// the store, and replies `AUTH_OK` or `AUTH_FAIL`. Any failure leaves
    /// the connection closed and no session registered.
    pub async fn authenticate(
        conn: Arc<Connection>,
        config: &CoordinatorConfig,
        store: &Arc<dyn Store>,
        server_version: &str,
    ) -> Result<Session, AuthError> {
        let timeouts = &config.timeouts;
        let msg = conn.receive_with_timeout(timeouts.auth()).await?;

        if msg.kind != MessageKind::Auth {
            let _ = conn
                .send_with_timeout(&Message::error(401, "expected AUTH message"), timeouts.write())
                .await;
            return Err(AuthError::Protocol(format!(
                "expected AUTH, got {}",
                msg.kind
            )));
        }

        let auth: AuthPayload = match msg.decode() {
            Ok(auth) => auth,
            Err(e) => {
                let _ = conn
                    .send_with_timeout(&Message::error(400, "invalid auth payload"), timeouts.write())
                    .await;
                return Err(AuthError::Protocol(format!("invalid auth payload: {e}")));
            }
        };

        let Some(credential) = config.worker_by_token(&auth.token) else {
            let fail = Message::new(
                MessageKind::AuthFail,
                &AuthFailPayload {
                    reason: "invalid token".to_string(),
                },
            )?;
            let _ = conn.send_with_timeout(&fail, timeouts.write()).await;
            return Err(AuthError::Rejected("invalid token".to_string()));
        };

        let worker_id = WorkerId::new(&credential.id);
        // The worker's self-reported ip is ignored; the socket peer address
        // is authoritative.
        let host = conn
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();

        store
            .upsert_worker(Worker {
                id: worker_id.clone(),
                name: credential.name.clone(),
                host,
                hostname: auth.hostname,
                version: auth.version,
                status: WorkerStatus::Online,
                last_heartbeat: now_millis(),
                registered_at: now_millis(),
                metrics: None,
            })
            .await?;

        let ok = Message::new(
            MessageKind::AuthOk,
            &AuthOkPayload {
                agent_id: credential.id.clone(),
                name: credential.name.clone(),
                server_version: server_version.to_string(),
            },
        )?;
        conn.send_with_timeout(&ok, timeouts.write()).await?;

        Ok(Session {
            id: generate_id(),
            worker_id,
            worker_name: credential.name.clone(),
            conn,
            connected_at: Instant::now(),
            last_pong: AtomicU64::new(now_millis()),
            cancel: tokio_util::sync::CancellationToken::new(),
            closing: AtomicBool::new(false),
            on_close: Mutex::new(None),
        })
    }

    /// Locally assigned session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Worker identity bound at handshake
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Worker display name bound at handshake
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// How long this session has been connected
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Whether the worker has been silent longer than the given threshold
    pub fn stale(&self, threshold: Duration) -> bool {
        millis_since(self.last_pong.load(Ordering::SeqCst)) > threshold.as_millis() as u64
    }

    /// Install the deregistration callback. Set once, at registration.
    pub fn set_close_hook(&self, hook: CloseHook) {
        *self.on_close.lock().expect("close hook lock poisoned") = Some(hook);
    }

    /// Drop the deregistration callback without invoking it. Called by the
    /// registry when it evicts or removes this session itself.
    pub fn discard_close_hook(&self) {
        self.on_close
            .lock()
            .expect("close hook lock poisoned")
            .take();
    }

    /// Signal the session to stop. Idempotent and non-blocking; the run
    /// loop performs the actual teardown.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    /// Whether `close` has been requested
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Send one frame to the worker under the given write deadline
    pub async fn send(&self, msg: &Message, deadline: Duration) -> Result<(), ProtocolError> {
        self.conn.send_with_timeout(msg, deadline).await
    }

    /// Read loop. Returns when the peer disconnects, the transport fails,
    /// or `close` is called; deregistration side effects run exactly once
    /// via the close hook before this returns.
    pub async fn run(&self, ctx: &SessionContext) {
        let idle = ctx.timeouts.read_idle();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.conn.receive_with_timeout(idle) => match result {
                    Ok(msg) => match self.dispatch(msg, ctx).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Exit) => break,
                        Err(e) => {
                            tracing::debug!("session {} write failed: {}", self.worker_name, e);
                            break;
                        }
                    },
                    // The idle deadline fired with the stream still open;
                    // liveness is the ping monitor's call, not ours.
                    Err(e) if e.is_read_timeout() => continue,
                    Err(e) => {
                        tracing::debug!("session {} read failed: {}", self.worker_name, e);
                        break;
                    }
                }
            }
        }

        self.closing.store(true, Ordering::SeqCst);
        self.conn.close().await;

        let hook = self
            .on_close
            .lock()
            .expect("close hook lock poisoned")
            .take();
        if let Some(hook) = hook {
            hook().await;
        }
    }

    /// Table-driven dispatch. Handlers are best-effort: malformed payloads
    /// are logged and dropped; only write failures propagate.
    async fn dispatch(&self, msg: Message, ctx: &SessionContext) -> Result<Flow, ProtocolError> {
        match msg.kind {
            MessageKind::Metrics => self.handle_metrics(&msg, ctx).await?,
            MessageKind::CommandAck => self.handle_command_ack(&msg, ctx).await,
            MessageKind::CommandStart => self.handle_command_start(&msg, ctx).await,
            MessageKind::CommandLog => self.handle_command_log(&msg, ctx).await,
            MessageKind::CommandDone => self.handle_command_done(&msg, ctx).await,
            MessageKind::Pong => {
                self.last_pong.store(now_millis(), Ordering::SeqCst);
            }
            MessageKind::Disconnect => {
                tracing::debug!("worker {} requested disconnect", self.worker_name);
                return Ok(Flow::Exit);
            }
            MessageKind::ContainerLogsData => {
                match msg.decode::<ContainerLogsDataPayload>() {
                    Ok(data) => {
                        if let Some(hook) = &ctx.hooks.on_container_log {
                            hook(&self.worker_id, &data);
                        }
                    }
                    Err(e) => tracing::warn!("malformed container log payload: {}", e),
                }
            }
            other => {
                tracing::trace!("ignoring {} from worker {}", other, self.worker_name);
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_metrics(
        &self,
        msg: &Message,
        ctx: &SessionContext,
    ) -> Result<(), ProtocolError> {
        let metrics: MetricsPayload = match msg.decode() {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::warn!("malformed metrics from {}: {}", self.worker_name, e);
                return Ok(());
            }
        };

        let worker_metrics = WorkerMetrics::from(&metrics.system);
        if let Err(e) = ctx
            .store
            .update_worker_metrics(&self.worker_id, worker_metrics.clone())
            .await
        {
            tracing::warn!("metrics update for {} failed: {}", self.worker_name, e);
        }

        if let Some(hook) = &ctx.hooks.on_metrics {
            hook(&self.worker_id, &worker_metrics);
        }

        // Snapshot unresolved alert messages for this worker once, then
        // dedup every predicate against it.
        let mut active: std::collections::HashSet<String> = match ctx.store.get_active_alerts().await
        {
            Ok(alerts) => alerts
                .into_iter()
                .filter(|a| a.worker_id == self.worker_id)
                .map(|a| a.message)
                .collect(),
            Err(e) => {
                tracing::warn!("alert lookup failed: {}", e);
                Default::default()
            }
        };

        for container in &metrics.containers {
            if let Err(e) = ctx
                .store
                .upsert_container(ContainerRecord::from_metrics(&self.worker_id, container))
                .await
            {
                tracing::warn!("container upsert failed: {}", e);
            }

            if !matches!(
                container.status.as_str(),
                "running" | "created" | "starting" | "restarting"
            ) {
                let alert =
                    alerts::container_down(&self.worker_id, &self.worker_name, &container.name);
                self.raise_alert(ctx, &mut active, alert).await;
            }
        }

        let system = &metrics.system;
        for alert in [
            alerts::check_cpu(&self.worker_id, &self.worker_name, system.cpu_percent),
            alerts::check_memory(&self.worker_id, &self.worker_name, system.memory_percent),
            alerts::check_disk(&self.worker_id, &self.worker_name, system.disk_percent),
        ]
        .into_iter()
        .flatten()
        {
            self.raise_alert(ctx, &mut active, alert).await;
        }

        self.send(&Message::empty(MessageKind::MetricsAck), ctx.timeouts.write())
            .await
    }

    async fn raise_alert(
        &self,
        ctx: &SessionContext,
        active: &mut std::collections::HashSet<String>,
        alert: uruflow_core::types::Alert,
    ) {
        if active.contains(&alert.message) {
            return;
        }
        active.insert(alert.message.clone());
        tracing::warn!("alert for {}: {}", self.worker_name, alert.message);
        if let Err(e) = ctx.store.create_alert(alert).await {
            tracing::warn!("alert creation failed: {}", e);
        }
    }

    async fn handle_command_ack(&self, msg: &Message, ctx: &SessionContext) {
        let ack: CommandAckPayload = match msg.decode() {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("malformed command ack: {}", e);
                return;
            }
        };

        if let Ok(Some(mut deployment)) = ctx.store.get_deployment(&ack.command_id).await {
            if deployment.status == DeployStatus::Pending {
                deployment.status = DeployStatus::Running;
                if let Err(e) = ctx.store.update_deployment(deployment).await {
                    tracing::warn!("deployment update failed: {}", e);
                }
            }
        }

        tracing::info!(
            "worker {} acknowledged command {}",
            self.worker_name,
            ack.command_id
        );
    }

    async fn handle_command_start(&self, msg: &Message, ctx: &SessionContext) {
        let start: CommandStartPayload = match msg.decode() {
            Ok(start) => start,
            Err(e) => {
                tracing::warn!("malformed command start: {}", e);
                return;
            }
        };

        if let Ok(Some(mut deployment)) = ctx.store.get_deployment(&start.command_id).await {
            deployment.status = DeployStatus::Running;
            if start.started_at > 0 {
                deployment.started_at = (start.started_at as u64) * 1000;
            }
            if let Err(e) = ctx.store.update_deployment(deployment).await {
                tracing::warn!("deployment update failed: {}", e);
            }
        }

        tracing::info!(
            "worker {} started deployment {}",
            self.worker_name,
            start.command_id
        );
    }

    async fn handle_command_log(&self, msg: &Message, ctx: &SessionContext) {
        let log: CommandLogPayload = match msg.decode() {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!("malformed command log: {}", e);
                return;
            }
        };

        let entry = DeploymentLog {
            deployment_id: log.command_id,
            line: log.line,
            stream: log.stream,
            timestamp: log.timestamp,
        };

        if let Err(e) = ctx.store.append_deployment_log(entry.clone()).await {
            tracing::warn!("deployment log append failed: {}", e);
        }

        if let Some(hook) = &ctx.hooks.on_command_log {
            hook(&self.worker_id, &entry);
        }
    }

    async fn handle_command_done(&self, msg: &Message, ctx: &SessionContext) {
        let done: CommandDonePayload = match msg.decode() {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!("malformed command done: {}", e);
                return;
            }
        };

        let Ok(Some(mut deployment)) = ctx.store.get_deployment(&done.command_id).await else {
            // Never synthesize a deployment for an unknown command
            tracing::debug!("command done for unknown deployment {}", done.command_id);
            return;
        };

        let status = if done.status == "success" {
            DeployStatus::Success
        } else {
            DeployStatus::Failed
        };

        let now = now_millis();
        deployment.status = status;
        deployment.output = done.output.clone();
        deployment.ended_at = Some(now);
        deployment.duration = now.saturating_sub(deployment.started_at) as i64;

        if let Err(e) = ctx.store.update_deployment(deployment).await {
            tracing::warn!("deployment update failed: {}", e);
        }

        if !done.output.is_empty() {
            let stream = if status == DeployStatus::Failed {
                "stderr"
            } else {
                "stdout"
            };
            let entry = DeploymentLog {
                deployment_id: done.command_id.clone(),
                line: done.output,
                stream: stream.to_string(),
                timestamp: now_secs(),
            };
            if let Err(e) = ctx.store.append_deployment_log(entry).await {
                tracing::warn!("deployment log append failed: {}", e);
            }
        }

        tracing::info!(
            "worker {} completed deployment {}: {}",
            self.worker_name,
            done.command_id,
            done.status
        );
    }
}
