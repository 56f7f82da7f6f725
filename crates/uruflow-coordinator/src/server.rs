//! Coordinator TCP/TLS server
//!
//! Accepts worker connections, authenticates each against the worker table,
//! registers the resulting session, and runs a global liveness ticker. Also
//! exposes the outbound send surface (commands, container log control) used
//! by the deployment service.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use uruflow_core::config::CoordinatorConfig;
use uruflow_core::types::WorkerId;
use uruflow_core::{Store, WorkerStatus};
use uruflow_protocol::message::{
    CommandPayload, ContainerLogsRequestPayload, ContainerLogsStopPayload,
};
use uruflow_protocol::{BoxedTransport, Connection, Message, MessageKind, ProtocolError};

use crate::alerts;
use crate::registry::Registry;
use crate::session::{Hooks, Session, SessionContext};
use crate::tls::{server_acceptor, TlsSetupError};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server startup failures
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsSetupError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound send failures
#[derive(Error, Debug)]
pub enum SendError {
    /// No active session for the worker
    #[error("worker {0} is not connected")]
    WorkerNotConnected(WorkerId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The coordinator's connection server
pub struct CoordinatorServer {
    config: CoordinatorConfig,
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    hooks: Hooks,
    cancel: CancellationToken,
}

impl CoordinatorServer {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            registry: Arc::new(Registry::new()),
            hooks: Hooks::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Replace the event hooks. Call before `start`.
    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.hooks = hooks;
    }

    /// Bind the listener, spawn the accept loop and the liveness ticker,
    /// and return the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let acceptor = server_acceptor(&self.config.tls)?;
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        if acceptor.is_some() {
            tracing::info!("listening on {} (TLS)", local_addr);
        } else {
            tracing::info!("listening on {}", local_addr);
        }

        let server = Arc::clone(self);
        tokio::spawn(async move { server.accept_loop(listener, acceptor).await });

        let server = Arc::clone(self);
        tokio::spawn(async move { server.liveness_loop().await });

        Ok(local_addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("accept loop shutting down");
                    return;
                }
                result = listener.accept() => match result {
                    Ok((socket, peer_addr)) => {
                        let server = Arc::clone(&self);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            server.handle_connection(socket, peer_addr, acceptor).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("accept failed: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        socket: TcpStream,
        peer_addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) {
        tracing::debug!("connection from {}", peer_addr);

        let transport: BoxedTransport = match acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(stream) => Box::new(stream),
                Err(e) => {
                    tracing::warn!("tls handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            },
            None => Box::new(socket),
        };

        let conn = Arc::new(Connection::with_peer_addr(transport, peer_addr));

        let session = match Session::authenticate(
            Arc::clone(&conn),
            &self.config,
            &self.store,
            SERVER_VERSION,
        )
        .await
        {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::warn!("auth from {} failed: {}", peer_addr, e);
                conn.close().await;
                return;
            }
        };

        let server = Arc::clone(&self);
        let worker_id = session.worker_id().clone();
        let worker_name = session.worker_name().to_string();
        let session_id = session.id().to_string();
        session.set_close_hook(Box::new(move || {
            Box::pin(async move {
                server.deregister(worker_id, worker_name, session_id).await;
            })
        }));

        self.registry.insert(Arc::clone(&session));
        tracing::info!(
            "worker {} connected from {}",
            session.worker_name(),
            peer_addr
        );

        let ctx = SessionContext {
            store: Arc::clone(&self.store),
            timeouts: self.config.timeouts.clone(),
            hooks: self.hooks.clone(),
        };
        session.run(&ctx).await;
    }

    /// Deregistration side effects, reached only through a session's close
    /// hook: drop the registry entry (unless a newer session displaced it),
    /// mark the worker offline, raise an offline alert, notify observers.
    async fn deregister(&self, worker_id: WorkerId, worker_name: String, session_id: String) {
        self.registry.remove_if_current(&worker_id, &session_id);

        if let Err(e) = self
            .store
            .set_worker_status(&worker_id, WorkerStatus::Offline)
            .await
        {
            tracing::warn!("status update for {} failed: {}", worker_name, e);
        }

        let offline = alerts::worker_offline(&worker_id, &worker_name);
        let duplicate = match self.store.get_active_alerts().await {
            Ok(alerts) => alerts
                .iter()
                .any(|a| a.worker_id == worker_id && a.message == offline.message),
            Err(_) => false,
        };
        if !duplicate {
            if let Err(e) = self.store.create_alert(offline).await {
                tracing::warn!("offline alert for {} failed: {}", worker_name, e);
            }
        }

        if let Some(hook) = &self.hooks.on_disconnect {
            hook(&worker_id);
        }

        tracing::info!("worker {} disconnected", worker_name);
    }

    /// Liveness ticker: every ping interval, close sessions whose last PONG
    /// is older than the pong timeout and ping the rest.
    async fn liveness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.timeouts.ping_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the immediate first tick so freshly accepted sessions get
        // a full interval before the first probe.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("liveness ticker shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let pong_timeout = self.config.timeouts.pong_timeout();
                    let write_timeout = self.config.timeouts.write();

                    for session in self.registry.snapshot() {
                        if session.stale(pong_timeout) {
                            tracing::warn!(
                                "worker {} missed liveness window, disconnecting",
                                session.worker_name()
                            );
                            session.close();
                            continue;
                        }

                        // Sends run off the ticker task so one stuck writer
                        // cannot stall the sweep.
                        tokio::spawn(async move {
                            if let Err(e) = session.send(&Message::ping(), write_timeout).await {
                                tracing::warn!(
                                    "ping to {} failed: {}",
                                    session.worker_name(),
                                    e
                                );
                                session.close();
                            }
                        });
                    }
                }
            }
        }
    }

    /// Whether a worker currently holds an active session
    pub fn is_worker_connected(&self, worker_id: &WorkerId) -> bool {
        self.registry.contains(worker_id)
    }

    /// IDs of all currently connected workers
    pub fn connected_workers(&self) -> Vec<WorkerId> {
        self.registry.worker_ids()
    }

    /// Send a command to a worker
    pub async fn send_command(
        &self,
        worker_id: &WorkerId,
        command: &CommandPayload,
    ) -> Result<(), SendError> {
        let session = self
            .registry
            .get(worker_id)
            .ok_or_else(|| SendError::WorkerNotConnected(worker_id.clone()))?;

        let msg = Message::new(MessageKind::Command, command)?;
        session.send(&msg, self.config.timeouts.write()).await?;
        Ok(())
    }

    /// Ask a worker to start streaming a container's logs
    pub async fn request_container_logs(
        &self,
        worker_id: &WorkerId,
        container_id: &str,
        tail: u32,
        follow: bool,
    ) -> Result<(), SendError> {
        let session = self
            .registry
            .get(worker_id)
            .ok_or_else(|| SendError::WorkerNotConnected(worker_id.clone()))?;

        let msg = Message::new(
            MessageKind::ContainerLogsRequest,
            &ContainerLogsRequestPayload {
                container_id: container_id.to_string(),
                tail,
                follow,
            },
        )?;
        session.send(&msg, self.config.timeouts.write()).await?;
        Ok(())
    }

    /// Ask a worker to stop streaming a container's logs. A missing session
    /// is not an error: there is nothing left to stop.
    pub async fn stop_container_logs(
        &self,
        worker_id: &WorkerId,
        container_id: &str,
    ) -> Result<(), SendError> {
        let Some(session) = self.registry.get(worker_id) else {
            return Ok(());
        };

        let msg = Message::new(
            MessageKind::ContainerLogsStop,
            &ContainerLogsStopPayload {
                container_id: container_id.to_string(),
            },
        )?;
        session.send(&msg, self.config.timeouts.write()).await?;
        Ok(())
    }

    /// Stop the server: end the accept loop and ticker, then send a
    /// best-effort DISCONNECT to every session and close it. Store records
    /// are left as-is; workers will reconnect to the next coordinator.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let write_timeout = self.config.timeouts.write();
        for session in self.registry.snapshot() {
            let _ = session.send(&Message::disconnect(), write_timeout).await;
            self.registry.remove(session.worker_id());
        }

        tracing::info!("coordinator stopped");
    }
}
