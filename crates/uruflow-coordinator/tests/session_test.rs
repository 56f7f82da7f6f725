//! Coordinator session tests over in-memory pipes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uruflow_coordinator::{Hooks, Registry, Session, SessionContext};
use uruflow_core::config::{CoordinatorConfig, WorkerCredential};
use uruflow_core::time::now_millis;
use uruflow_core::types::{DeployStatus, Deployment, WorkerId};
use uruflow_core::{MemoryStore, Store};
use uruflow_protocol::message::{
    AuthFailPayload, AuthOkPayload, AuthPayload, CommandAckPayload, CommandDonePayload,
    CommandLogPayload, CommandStartPayload, ErrorPayload, MetricsPayload, SystemMetrics,
};
use uruflow_protocol::{Connection, Message, MessageKind};

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        workers: vec![WorkerCredential {
            id: "w1".to_string(),
            name: "prod".to_string(),
            token: "secret".to_string(),
        }],
        ..Default::default()
    }
}

fn conn_pair() -> (Arc<Connection>, Arc<Connection>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        Arc::new(Connection::new(Box::new(a))),
        Arc::new(Connection::new(Box::new(b))),
    )
}

fn auth_message(token: &str) -> Message {
    Message::new(
        MessageKind::Auth,
        &AuthPayload {
            token: token.to_string(),
            hostname: "build-1".to_string(),
            ip: None,
            version: "1.0.0".to_string(),
        },
    )
    .unwrap()
}

async fn authenticated_session(
    config: &CoordinatorConfig,
    store: &Arc<dyn Store>,
) -> (Arc<Session>, Arc<Connection>) {
    let (coord_conn, worker_conn) = conn_pair();
    worker_conn.send(&auth_message("secret")).await.unwrap();

    let session = Session::authenticate(coord_conn, config, store, "1.0.0")
        .await
        .unwrap();

    let reply = worker_conn.receive().await.unwrap();
    assert_eq!(reply.kind, MessageKind::AuthOk);

    (Arc::new(session), worker_conn)
}

fn context(store: &Arc<dyn Store>, config: &CoordinatorConfig) -> SessionContext {
    SessionContext {
        store: Arc::clone(store),
        timeouts: config.timeouts.clone(),
        hooks: Hooks::default(),
    }
}

fn pending_deployment(id: &str) -> Deployment {
    Deployment {
        id: id.to_string(),
        repository: "api".to_string(),
        branch: "main".to_string(),
        commit: "abc123".to_string(),
        worker_id: WorkerId::new("w1"),
        worker_name: "prod".to_string(),
        status: DeployStatus::Pending,
        output: String::new(),
        duration: 0,
        started_at: now_millis(),
        ended_at: None,
        trigger: "manual".to_string(),
    }
}

#[tokio::test]
async fn handshake_happy_path_binds_identity_and_records_presence() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    let (session, worker_conn) = authenticated_session(&config, &store).await;

    assert_eq!(session.worker_id(), &WorkerId::new("w1"));
    assert_eq!(session.worker_name(), "prod");

    let worker = store
        .get_worker(&WorkerId::new("w1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.status, uruflow_core::WorkerStatus::Online);
    assert_eq!(worker.hostname, "build-1");
    assert!(now_millis() - worker.last_heartbeat < 5_000);

    drop(worker_conn);
}

#[tokio::test]
async fn handshake_unknown_token_is_rejected() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (coord_conn, worker_conn) = conn_pair();

    worker_conn.send(&auth_message("wrong")).await.unwrap();

    let result = Session::authenticate(coord_conn, &config, &store, "1.0.0").await;
    assert!(result.is_err());

    let reply = worker_conn.receive().await.unwrap();
    assert_eq!(reply.kind, MessageKind::AuthFail);
    let fail: AuthFailPayload = reply.decode().unwrap();
    assert_eq!(fail.reason, "invalid token");

    // No presence was recorded for the rejected peer
    assert!(store
        .get_worker(&WorkerId::new("w1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn handshake_rejects_non_auth_first_frame() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (coord_conn, worker_conn) = conn_pair();

    worker_conn.send(&Message::ping()).await.unwrap();

    let result = Session::authenticate(coord_conn, &config, &store, "1.0.0").await;
    assert!(result.is_err());

    let reply = worker_conn.receive().await.unwrap();
    assert_eq!(reply.kind, MessageKind::Error);
    let error: ErrorPayload = reply.decode().unwrap();
    assert_eq!(error.code, 401);
}

#[tokio::test]
async fn handshake_times_out_without_auth_frame() {
    let mut config = test_config();
    config.timeouts.auth_secs = 1;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (coord_conn, _worker_conn) = conn_pair();

    let result = Session::authenticate(coord_conn, &config, &store, "1.0.0").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn auth_ok_carries_assigned_identity() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (coord_conn, worker_conn) = conn_pair();

    worker_conn.send(&auth_message("secret")).await.unwrap();
    Session::authenticate(coord_conn, &config, &store, "2.1.0")
        .await
        .unwrap();

    let reply = worker_conn.receive().await.unwrap();
    let ok: AuthOkPayload = reply.decode().unwrap();
    assert_eq!(ok.agent_id, "w1");
    assert_eq!(ok.name, "prod");
    assert_eq!(ok.server_version, "2.1.0");
}

#[tokio::test]
async fn metrics_frame_is_acked_and_stored() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (session, worker_conn) = authenticated_session(&config, &store).await;

    let ctx = context(&store, &config);
    let run_session = Arc::clone(&session);
    let run = tokio::spawn(async move { run_session.run(&ctx).await });

    let metrics = Message::new(
        MessageKind::Metrics,
        &MetricsPayload {
            timestamp: 1,
            system: SystemMetrics {
                cpu_percent: 42.0,
                memory_percent: 50.0,
                ..Default::default()
            },
            containers: vec![],
        },
    )
    .unwrap();
    worker_conn.send(&metrics).await.unwrap();

    let ack = worker_conn.receive().await.unwrap();
    assert_eq!(ack.kind, MessageKind::MetricsAck);
    assert!(ack.payload.is_empty());

    let worker = store
        .get_worker(&WorkerId::new("w1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.metrics.unwrap().cpu_percent, 42.0);

    worker_conn.send(&Message::disconnect()).await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn repeated_threshold_breaches_raise_one_alert() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (session, worker_conn) = authenticated_session(&config, &store).await;

    let ctx = context(&store, &config);
    let run_session = Arc::clone(&session);
    let run = tokio::spawn(async move { run_session.run(&ctx).await });

    for _ in 0..2 {
        let metrics = Message::new(
            MessageKind::Metrics,
            &MetricsPayload {
                timestamp: 1,
                system: SystemMetrics {
                    cpu_percent: 97.0,
                    ..Default::default()
                },
                containers: vec![],
            },
        )
        .unwrap();
        worker_conn.send(&metrics).await.unwrap();
        let ack = worker_conn.receive().await.unwrap();
        assert_eq!(ack.kind, MessageKind::MetricsAck);
    }

    let cpu_alerts: Vec<_> = store
        .get_active_alerts()
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.kind == "high_cpu")
        .collect();
    assert_eq!(cpu_alerts.len(), 1);

    worker_conn.send(&Message::disconnect()).await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn malformed_payload_is_dropped_without_killing_session() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (session, worker_conn) = authenticated_session(&config, &store).await;

    let ctx = context(&store, &config);
    let run_session = Arc::clone(&session);
    let run = tokio::spawn(async move { run_session.run(&ctx).await });

    // Garbage where MetricsPayload is expected: logged and dropped
    let garbage = Message {
        kind: MessageKind::Metrics,
        payload: bytes::Bytes::from_static(b"not json"),
    };
    worker_conn.send(&garbage).await.unwrap();

    // The session must still answer a well-formed frame afterwards
    let metrics = Message::new(
        MessageKind::Metrics,
        &MetricsPayload {
            timestamp: 1,
            system: SystemMetrics::default(),
            containers: vec![],
        },
    )
    .unwrap();
    worker_conn.send(&metrics).await.unwrap();
    let ack = worker_conn.receive().await.unwrap();
    assert_eq!(ack.kind, MessageKind::MetricsAck);

    worker_conn.send(&Message::disconnect()).await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn command_lifecycle_updates_deployment() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .create_deployment(pending_deployment("d1"))
        .await
        .unwrap();

    let (session, worker_conn) = authenticated_session(&config, &store).await;
    let ctx = context(&store, &config);
    let run_session = Arc::clone(&session);
    let run = tokio::spawn(async move { run_session.run(&ctx).await });

    worker_conn
        .send(
            &Message::new(
                MessageKind::CommandAck,
                &CommandAckPayload {
                    command_id: "d1".to_string(),
                    status: "received".to_string(),
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();

    worker_conn
        .send(
            &Message::new(
                MessageKind::CommandStart,
                &CommandStartPayload {
                    command_id: "d1".to_string(),
                    started_at: uruflow_core::time::now_secs(),
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();

    for line in ["› cloning...", "› running compose"] {
        worker_conn
            .send(
                &Message::new(
                    MessageKind::CommandLog,
                    &CommandLogPayload {
                        command_id: "d1".to_string(),
                        line: line.to_string(),
                        stream: "stdout".to_string(),
                        timestamp: 1,
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();
    }

    worker_conn
        .send(
            &Message::new(
                MessageKind::CommandDone,
                &CommandDonePayload {
                    command_id: "d1".to_string(),
                    status: "success".to_string(),
                    exit_code: 0,
                    duration: 1500,
                    output: String::new(),
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();

    // Frames on one connection arrive in order; disconnect flushes the rest
    worker_conn.send(&Message::disconnect()).await.unwrap();
    run.await.unwrap();

    let deployment = store.get_deployment("d1").await.unwrap().unwrap();
    assert_eq!(deployment.status, DeployStatus::Success);
    assert!(deployment.ended_at.is_some());

    let logs = store.get_deployment_logs("d1").await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].line, "› cloning...");
}

#[tokio::test]
async fn failed_done_appends_output_as_stderr_log() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .create_deployment(pending_deployment("d2"))
        .await
        .unwrap();

    let (session, worker_conn) = authenticated_session(&config, &store).await;
    let ctx = context(&store, &config);
    let run_session = Arc::clone(&session);
    let run = tokio::spawn(async move { run_session.run(&ctx).await });

    worker_conn
        .send(
            &Message::new(
                MessageKind::CommandDone,
                &CommandDonePayload {
                    command_id: "d2".to_string(),
                    status: "failed".to_string(),
                    exit_code: 1,
                    duration: 10,
                    output: "compose build failed".to_string(),
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();
    worker_conn.send(&Message::disconnect()).await.unwrap();
    run.await.unwrap();

    let deployment = store.get_deployment("d2").await.unwrap().unwrap();
    assert_eq!(deployment.status, DeployStatus::Failed);
    assert_eq!(deployment.output, "compose build failed");

    let logs = store.get_deployment_logs("d2").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].stream, "stderr");
}

#[tokio::test]
async fn unknown_command_done_is_ignored() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    let (session, worker_conn) = authenticated_session(&config, &store).await;
    let ctx = context(&store, &config);
    let run_session = Arc::clone(&session);
    let run = tokio::spawn(async move { run_session.run(&ctx).await });

    worker_conn
        .send(
            &Message::new(
                MessageKind::CommandDone,
                &CommandDonePayload {
                    command_id: "ghost".to_string(),
                    status: "success".to_string(),
                    exit_code: 0,
                    duration: 1,
                    output: String::new(),
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();
    worker_conn.send(&Message::disconnect()).await.unwrap();
    run.await.unwrap();

    // No deployment record may be synthesized
    assert!(store.get_deployment("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn pong_refreshes_liveness() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (session, worker_conn) = authenticated_session(&config, &store).await;

    let ctx = context(&store, &config);
    let run_session = Arc::clone(&session);
    let run = tokio::spawn(async move { run_session.run(&ctx).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(session.stale(Duration::from_millis(100)));

    worker_conn.send(&Message::pong()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!session.stale(Duration::from_millis(100)));

    worker_conn.send(&Message::disconnect()).await.unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn close_hook_runs_exactly_once_on_session_exit() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (session, worker_conn) = authenticated_session(&config, &store).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);
    session.set_close_hook(Box::new(move || {
        Box::pin(async move {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        })
    }));

    let ctx = context(&store, &config);
    let run_session = Arc::clone(&session);
    let run = tokio::spawn(async move { run_session.run(&ctx).await });

    worker_conn.send(&Message::disconnect()).await.unwrap();
    run.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn discarded_close_hook_never_runs() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (session, worker_conn) = authenticated_session(&config, &store).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);
    session.set_close_hook(Box::new(move || {
        Box::pin(async move {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        })
    }));
    session.discard_close_hook();

    let ctx = context(&store, &config);
    let run_session = Arc::clone(&session);
    let run = tokio::spawn(async move { run_session.run(&ctx).await });

    worker_conn.send(&Message::disconnect()).await.unwrap();
    run.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn registry_enforces_single_session_per_worker() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let registry = Registry::new();

    let (first, _first_worker) = authenticated_session(&config, &store).await;
    let (second, _second_worker) = authenticated_session(&config, &store).await;

    registry.insert(Arc::clone(&first));
    assert_eq!(registry.len(), 1);

    registry.insert(Arc::clone(&second));
    assert_eq!(registry.len(), 1);

    // The older session was evicted and closed; the newer one is active
    assert!(first.is_closing());
    assert!(!second.is_closing());
    let active = registry.get(&WorkerId::new("w1")).unwrap();
    assert_eq!(active.id(), second.id());
}

#[tokio::test]
async fn registry_remove_if_current_spares_newer_session() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let registry = Registry::new();

    let (first, _fw) = authenticated_session(&config, &store).await;
    let (second, _sw) = authenticated_session(&config, &store).await;

    registry.insert(Arc::clone(&first));
    registry.insert(Arc::clone(&second));

    // The evicted session's cleanup must not unseat its replacement
    assert!(!registry.remove_if_current(&WorkerId::new("w1"), first.id()));
    assert!(registry.contains(&WorkerId::new("w1")));

    assert!(registry.remove_if_current(&WorkerId::new("w1"), second.id()));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn registry_remove_closes_without_hook() {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let registry = Registry::new();

    let (session, _worker) = authenticated_session(&config, &store).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);
    session.set_close_hook(Box::new(move || {
        Box::pin(async move {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        })
    }));

    registry.insert(Arc::clone(&session));
    let removed = registry.remove(&WorkerId::new("w1")).unwrap();
    assert!(removed.is_closing());
    assert!(registry.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
