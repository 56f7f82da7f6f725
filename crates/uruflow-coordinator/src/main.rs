//! UruFlow coordinator daemon
//!
//! Binds the TCP/TLS listener, accepts worker connections, and runs until
//! SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uruflow_coordinator::CoordinatorServer;
use uruflow_core::config::{self, CoordinatorConfig};
use uruflow_core::MemoryStore;

#[derive(Parser)]
#[command(name = "uruflow-coordinator")]
#[command(about = "UruFlow deployment coordinator")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address, host:port (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("UruFlow coordinator starting");

    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        let default_path = config::default_config_dir().join("coordinator.toml");
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("failed to load {}: {}", default_path.display(), e);
                CoordinatorConfig::default()
            })
        } else {
            tracing::info!("using default configuration");
            CoordinatorConfig::default()
        }
    };

    if let Some(bind) = &args.bind {
        let (host, port) = bind
            .rsplit_once(':')
            .context("--bind expects host:port")?;
        config.server.host = host.to_string();
        config.server.tcp_port = port.parse().context("invalid --bind port")?;
    }

    if config.workers.is_empty() {
        tracing::warn!("no workers configured; every connection will be rejected");
    }

    let store = Arc::new(MemoryStore::new());
    tracing::warn!("using in-memory store; records do not survive restarts");

    let server = Arc::new(CoordinatorServer::new(config, store));
    server.start().await.context("failed to start server")?;

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received");
    server.shutdown().await;

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
