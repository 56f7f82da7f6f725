//! Worker session: connect, authenticate, serve, reconnect
//!
//! The worker holds a single outbound connection to the coordinator. One
//! reader task feeds decoded frames to the main loop, which multiplexes
//! them with the metrics ticker and the stop signal. Long-running work
//! (deploys, container log streams) runs in detached tasks so the read
//! loop never blocks; every such task is bounded by a deadline or a
//! cancellation handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use uruflow_core::config::WorkerConfig;
use uruflow_core::time::now_secs;
use uruflow_protocol::message::{
    AuthFailPayload, AuthOkPayload, AuthPayload, CommandAckPayload, CommandDonePayload,
    CommandLogPayload, CommandPayload, CommandStartPayload, ContainerLogsDataPayload,
    ContainerLogsRequestPayload, ContainerLogsStopPayload, ContainerMetrics, MetricsPayload,
};
use uruflow_protocol::{BoxedTransport, Connection, Message, MessageKind, ProtocolError};

use crate::deploy::{DeployConfig, Deployer, LogLine};
use crate::docker::{ContainerRuntime, STDERR_PREFIX};
use crate::metrics::SystemProbe;
use crate::tls::client_connector;

const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Read slice for cooperative polling of the stop signal
const READ_SLICE: Duration = Duration::from_secs(1);
/// Absolute bound on a single deploy
const COMMAND_DEADLINE: Duration = Duration::from_secs(600);

/// Connection establishment failures
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connection timed out")]
    DialTimeout,

    #[error("invalid coordinator host: {0}")]
    InvalidServerName(String),

    /// The coordinator rejected our token
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The coordinator answered the handshake with something unexpected
    #[error("unexpected handshake response: {0}")]
    AuthProtocol(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

enum Flow {
    Continue,
    Reconnect,
}

struct LogStreamHandle {
    seq: u64,
    cancel: CancellationToken,
}

/// The worker's long-lived session state machine
pub struct WorkerSession {
    config: WorkerConfig,
    deployer: Arc<dyn Deployer>,
    probe: Arc<dyn SystemProbe>,
    docker: Option<Arc<dyn ContainerRuntime>>,
    stop: CancellationToken,
    /// (worker_id, name) assigned by the coordinator at handshake
    identity: Mutex<Option<(String, String)>>,
    /// Active container log streams, at most one per container
    log_streams: Arc<Mutex<HashMap<String, LogStreamHandle>>>,
    stream_seq: AtomicU64,
}

impl WorkerSession {
    pub fn new(
        config: WorkerConfig,
        deployer: Arc<dyn Deployer>,
        probe: Arc<dyn SystemProbe>,
        docker: Option<Arc<dyn ContainerRuntime>>,
    ) -> Self {
        Self {
            config,
            deployer,
            probe,
            docker,
            stop: CancellationToken::new(),
            identity: Mutex::new(None),
            log_streams: Arc::new(Mutex::new(HashMap::new())),
            stream_seq: AtomicU64::new(0),
        }
    }

    /// Token that stops the session when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Signal the session to stop
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Identity assigned by the coordinator, once authenticated
    pub fn identity(&self) -> Option<(String, String)> {
        self.identity.lock().expect("identity lock poisoned").clone()
    }

    /// Number of active container log streams
    pub fn active_log_streams(&self) -> usize {
        self.log_streams.lock().expect("stream lock poisoned").len()
    }

    /// Connect-serve-reconnect loop. Returns only when stopped; every
    /// session-fatal error re-enters the reconnect sleep.
    pub async fn run(&self) {
        tracing::info!("worker starting, coordinator {}", self.config.server_addr());

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            let conn = match self.connect().await {
                Ok(conn) => conn,
                Err(ConnectError::AuthRejected(reason)) => {
                    tracing::warn!("authentication rejected: {}", reason);
                    if !self.sleep_before_retry().await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!("connect failed: {}", e);
                    if !self.sleep_before_retry().await {
                        break;
                    }
                    continue;
                }
            };

            self.run_loop(conn).await;
        }

        tracing::info!("worker stopped");
    }

    /// Sleep the reconnect backoff; false when stop fired during the wait
    async fn sleep_before_retry(&self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.config.server.reconnect_delay()) => true,
        }
    }

    /// Dial, optionally wrap in TLS, and authenticate
    async fn connect(&self) -> Result<Arc<Connection>, ConnectError> {
        let addr = self.config.server_addr();
        tracing::debug!("connecting to {}", addr);

        let socket = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectError::DialTimeout)??;

        let transport: BoxedTransport = if self.config.server.tls {
            let connector = client_connector(self.config.server.tls_skip_verify);
            let server_name = rustls::pki_types::ServerName::try_from(
                self.config.server.host.clone(),
            )
            .map_err(|_| ConnectError::InvalidServerName(self.config.server.host.clone()))?;
            Box::new(connector.connect(server_name, socket).await?)
        } else {
            Box::new(socket)
        };

        let conn = Arc::new(Connection::new(transport));

        if let Err(e) = self.authenticate(&conn).await {
            conn.close().await;
            return Err(e);
        }

        Ok(conn)
    }

    /// AUTH is always our first frame; AUTH_OK/AUTH_FAIL is always the
    /// coordinator's first reply.
    async fn authenticate(&self, conn: &Connection) -> Result<(), ConnectError> {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();

        let auth = Message::new(
            MessageKind::Auth,
            &AuthPayload {
                token: self.config.token.clone(),
                hostname,
                ip: None,
                version: WORKER_VERSION.to_string(),
            },
        )?;
        conn.send_with_timeout(&auth, AUTH_TIMEOUT).await?;

        let reply = conn.receive_with_timeout(AUTH_TIMEOUT).await?;
        match reply.kind {
            MessageKind::AuthOk => {
                let ok: AuthOkPayload = reply.decode()?;
                tracing::info!("authenticated as {} (id: {})", ok.name, ok.agent_id);
                *self.identity.lock().expect("identity lock poisoned") =
                    Some((ok.agent_id, ok.name));
                Ok(())
            }
            MessageKind::AuthFail => {
                let reason = reply
                    .decode::<AuthFailPayload>()
                    .map(|fail| fail.reason)
                    .unwrap_or_else(|_| "unspecified".to_string());
                Err(ConnectError::AuthRejected(reason))
            }
            other => Err(ConnectError::AuthProtocol(other.to_string())),
        }
    }

    /// Serve one connection until stop, peer disconnect, or transport error
    async fn run_loop(&self, conn: Arc<Connection>) {
        let reader_cancel = CancellationToken::new();
        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(16);
        let (err_tx, mut err_rx) = mpsc::channel::<ProtocolError>(1);

        let reader = {
            let conn = Arc::clone(&conn);
            let cancel = reader_cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = conn.receive_with_timeout(READ_SLICE) => match result {
                            Ok(msg) => {
                                if msg_tx.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) if e.is_read_timeout() => continue,
                            Err(e) => {
                                let _ = err_tx.send(e).await;
                                return;
                            }
                        }
                    }
                }
            })
        };

        let mut metrics_ticker = tokio::time::interval(self.config.server.metrics_interval());
        metrics_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick fires immediately, pushing metrics right after the
        // handshake.
        let reason = loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    let _ = conn.send_with_timeout(&Message::disconnect(), WRITE_TIMEOUT).await;
                    break "stop requested";
                }
                _ = metrics_ticker.tick() => {
                    if let Err(e) = self.send_metrics(&conn).await {
                        tracing::debug!("metrics push failed: {}", e);
                        break "write failed";
                    }
                }
                msg = msg_rx.recv() => match msg {
                    Some(msg) => match self.handle(&conn, msg).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Reconnect) => break "coordinator requested disconnect",
                        Err(e) => {
                            tracing::debug!("reply failed: {}", e);
                            break "write failed";
                        }
                    },
                    None => break "reader stopped",
                },
                err = err_rx.recv() => {
                    if let Some(e) = err {
                        tracing::debug!("read failed: {}", e);
                    }
                    break "connection lost";
                }
            }
        };

        tracing::info!("disconnected: {}", reason);

        reader_cancel.cancel();
        self.cancel_log_streams();
        conn.close().await;
        let _ = reader.await;
    }

    async fn handle(&self, conn: &Arc<Connection>, msg: Message) -> Result<Flow, ProtocolError> {
        match msg.kind {
            MessageKind::Ping => {
                conn.send_with_timeout(&Message::pong(), WRITE_TIMEOUT).await?;
            }

            MessageKind::Command => match msg.decode::<CommandPayload>() {
                Ok(command) => {
                    // Dispatch in a new task so the read loop keeps serving
                    // pings and log-stream control while a deploy runs.
                    tokio::spawn(handle_command(
                        Arc::clone(conn),
                        Arc::clone(&self.deployer),
                        command,
                    ));
                }
                Err(e) => tracing::warn!("malformed command payload: {}", e),
            },

            MessageKind::MetricsAck => {}

            MessageKind::Disconnect => return Ok(Flow::Reconnect),

            MessageKind::ContainerLogsRequest => match msg.decode::<ContainerLogsRequestPayload>()
            {
                Ok(request) => self.start_log_stream(conn, request),
                Err(e) => tracing::warn!("malformed container logs request: {}", e),
            },

            MessageKind::ContainerLogsStop => match msg.decode::<ContainerLogsStopPayload>() {
                Ok(stop) => self.stop_log_stream(&stop.container_id),
                Err(e) => tracing::warn!("malformed container logs stop: {}", e),
            },

            other => {
                tracing::warn!("unexpected message from coordinator: {}", other);
            }
        }

        Ok(Flow::Continue)
    }

    /// Gather system metrics, attach managed-container telemetry when the
    /// docker collaborator is available, and push METRICS. A missing or
    /// failing docker daemon skips the container portion without failing
    /// the session.
    async fn send_metrics(&self, conn: &Connection) -> Result<(), ProtocolError> {
        let system = match self.probe.collect().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("metrics collection failed: {}", e);
                return Ok(());
            }
        };

        let mut payload = MetricsPayload {
            timestamp: now_secs(),
            system: system.into(),
            containers: Vec::new(),
        };

        if let Some(docker) = &self.docker {
            match docker.list_containers().await {
                Ok(containers) => {
                    for c in containers.into_iter().filter(|c| c.managed) {
                        let mut metrics = ContainerMetrics {
                            id: c.id.clone(),
                            name: c.name,
                            image: c.image,
                            status: c.state.clone(),
                            health: c.health,
                            restart_count: c.restart_count,
                            started_at: c.started_at,
                            ..Default::default()
                        };

                        if c.state == "running" {
                            match docker.container_stats(&c.id).await {
                                Ok(stats) => {
                                    metrics.cpu_percent = stats.cpu_percent;
                                    metrics.memory_usage = stats.memory_usage;
                                    metrics.memory_limit = stats.memory_limit;
                                    metrics.network_rx = stats.network_rx;
                                    metrics.network_tx = stats.network_tx;
                                }
                                Err(e) => {
                                    tracing::debug!("stats for {} failed: {}", c.id, e)
                                }
                            }
                        }

                        payload.containers.push(metrics);
                    }
                }
                Err(e) => tracing::debug!("container listing failed: {}", e),
            }
        }

        let msg = Message::new(MessageKind::Metrics, &payload)?;
        conn.send_with_timeout(&msg, WRITE_TIMEOUT).await
    }

    /// Start tailing a container's logs, cancelling any prior stream for
    /// the same container first.
    fn start_log_stream(&self, conn: &Arc<Connection>, request: ContainerLogsRequestPayload) {
        let Some(docker) = self.docker.clone() else {
            tracing::warn!(
                "container logs requested for {} but docker is unavailable",
                request.container_id
            );
            return;
        };

        let cancel = CancellationToken::new();
        let seq = self.stream_seq.fetch_add(1, Ordering::Relaxed);

        {
            let mut streams = self.log_streams.lock().expect("stream lock poisoned");
            if let Some(previous) = streams.insert(
                request.container_id.clone(),
                LogStreamHandle {
                    seq,
                    cancel: cancel.clone(),
                },
            ) {
                tracing::debug!("replacing log stream for {}", request.container_id);
                previous.cancel.cancel();
            }
        }

        let conn = Arc::clone(conn);
        let streams = Arc::clone(&self.log_streams);
        tokio::spawn(async move {
            let container_id = request.container_id.clone();
            let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

            let tail_task = {
                let docker = Arc::clone(&docker);
                let container_id = container_id.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = docker
                        .stream_logs(&container_id, request.tail, request.follow, line_tx, cancel)
                        .await
                    {
                        tracing::debug!("log stream for {} ended: {}", container_id, e);
                    }
                })
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = line_rx.recv() => match line {
                        None => break,
                        Some(raw) => {
                            let (stream, line) = split_stderr_sentinel(raw);
                            let payload = ContainerLogsDataPayload {
                                container_id: container_id.clone(),
                                line,
                                stream: stream.to_string(),
                                timestamp: now_secs(),
                            };
                            let msg = match Message::new(MessageKind::ContainerLogsData, &payload) {
                                Ok(msg) => msg,
                                Err(_) => continue,
                            };
                            if conn.send_with_timeout(&msg, WRITE_TIMEOUT).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            cancel.cancel();
            let _ = tail_task.await;

            // Discard our handle unless a replacement has taken the slot
            let mut streams = streams.lock().expect("stream lock poisoned");
            if streams
                .get(&container_id)
                .map(|handle| handle.seq == seq)
                .unwrap_or(false)
            {
                streams.remove(&container_id);
            }
        });
    }

    fn stop_log_stream(&self, container_id: &str) {
        let handle = self
            .log_streams
            .lock()
            .expect("stream lock poisoned")
            .remove(container_id);
        if let Some(handle) = handle {
            tracing::debug!("stopping log stream for {}", container_id);
            handle.cancel.cancel();
        }
    }

    /// Cancel every in-flight log stream and drain the table
    fn cancel_log_streams(&self) {
        let mut streams = self.log_streams.lock().expect("stream lock poisoned");
        for (_, handle) in streams.drain() {
            handle.cancel.cancel();
        }
    }
}

/// Split the stderr sentinel prefix off a raw log line
fn split_stderr_sentinel(raw: String) -> (&'static str, String) {
    match raw.strip_prefix(STDERR_PREFIX) {
        Some(rest) => ("stderr", rest.to_string()),
        None => ("stdout", raw),
    }
}

/// Acknowledge and dispatch one command. Runs detached from the read loop.
async fn handle_command(conn: Arc<Connection>, deployer: Arc<dyn Deployer>, command: CommandPayload) {
    tracing::info!(
        "received command: {} (id: {})",
        command.command_type,
        command.id
    );

    let ack = Message::new(
        MessageKind::CommandAck,
        &CommandAckPayload {
            command_id: command.id.clone(),
            status: "received".to_string(),
        },
    )
    .expect("ack payload encodes");
    if conn.send_with_timeout(&ack, WRITE_TIMEOUT).await.is_err() {
        return;
    }

    match command.command_type.as_str() {
        "deploy" => handle_deploy(conn, deployer, command).await,
        other => tracing::warn!("unknown command type: {}", other),
    }
}

/// Execute a deploy command end to end: START, streamed LOG lines, then
/// exactly one terminal DONE. Decode and validation failures short-circuit
/// straight to a failed DONE.
async fn handle_deploy(conn: Arc<Connection>, deployer: Arc<dyn Deployer>, command: CommandPayload) {
    let config: DeployConfig = match serde_json::from_value(command.payload) {
        Ok(config) => config,
        Err(e) => {
            send_done(&conn, &command.id, "failed", 1, 0, &e.to_string()).await;
            return;
        }
    };

    if config.url.is_empty() {
        send_done(&conn, &command.id, "failed", 1, 0, "repository URL is required").await;
        return;
    }

    let start_msg = Message::new(
        MessageKind::CommandStart,
        &CommandStartPayload {
            command_id: command.id.clone(),
            started_at: now_secs(),
        },
    )
    .expect("start payload encodes");
    if conn.send_with_timeout(&start_msg, WRITE_TIMEOUT).await.is_err() {
        return;
    }

    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LogLine>();
    let forwarder = {
        let conn = Arc::clone(&conn);
        let command_id = command.id.clone();
        tokio::spawn(async move {
            while let Some(entry) = log_rx.recv().await {
                let payload = CommandLogPayload {
                    command_id: command_id.clone(),
                    line: entry.line,
                    stream: entry.stream,
                    timestamp: now_secs(),
                };
                let msg = match Message::new(MessageKind::CommandLog, &payload) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                if conn.send_with_timeout(&msg, WRITE_TIMEOUT).await.is_err() {
                    break;
                }
            }
        })
    };

    let started = Instant::now();
    let result = tokio::time::timeout(COMMAND_DEADLINE, deployer.execute(&config, log_tx)).await;

    // The executor's sender is gone; wait for the forwarder to flush every
    // log line so DONE is the last frame for this command.
    let _ = forwarder.await;

    let duration = started.elapsed().as_millis() as i64;
    let (status, exit_code, output) = match result {
        Ok(Ok(_outcome)) => ("success", 0, String::new()),
        Ok(Err(e)) => ("failed", 1, e.to_string()),
        Err(_) => (
            "failed",
            1,
            format!("deploy timed out after {}s", COMMAND_DEADLINE.as_secs()),
        ),
    };

    send_done(&conn, &command.id, status, exit_code, duration, &output).await;
    tracing::info!("deploy {} finished: {}", command.id, status);
}

async fn send_done(
    conn: &Connection,
    command_id: &str,
    status: &str,
    exit_code: i32,
    duration: i64,
    output: &str,
) {
    let payload = CommandDonePayload {
        command_id: command_id.to_string(),
        status: status.to_string(),
        exit_code,
        duration,
        output: output.to_string(),
    };
    let msg = Message::new(MessageKind::CommandDone, &payload).expect("done payload encodes");
    if let Err(e) = conn.send_with_timeout(&msg, WRITE_TIMEOUT).await {
        tracing::warn!("command done for {} failed: {}", command_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_sentinel_split() {
        let (stream, line) = split_stderr_sentinel("[stderr] boom".to_string());
        assert_eq!(stream, "stderr");
        assert_eq!(line, "boom");

        let (stream, line) = split_stderr_sentinel("plain line".to_string());
        assert_eq!(stream, "stdout");
        assert_eq!(line, "plain line");
    }

    #[test]
    fn test_sentinel_only_strips_prefix() {
        let (stream, line) = split_stderr_sentinel("middle [stderr] marker".to_string());
        assert_eq!(stream, "stdout");
        assert_eq!(line, "middle [stderr] marker");
    }
}
