//! UruFlow worker daemon
//!
//! Connects out to the coordinator, authenticates with the provisioned
//! token, and serves deploy commands until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uruflow_core::config::{self, WorkerConfig};
use uruflow_worker::docker::DockerRuntime;
use uruflow_worker::{GitDeployer, SysinfoProbe, WorkerSession};

#[derive(Parser)]
#[command(name = "uruflow-worker")]
#[command(about = "UruFlow deployment worker")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Coordinator address, host:port (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Worker token (overrides config)
    #[arg(short, long)]
    token: Option<String>,

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

    tracing::info!("UruFlow worker starting");

    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        let default_path = config::default_config_dir().join("worker.toml");
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("failed to load {}: {}", default_path.display(), e);
                WorkerConfig::default()
            })
        } else {
            tracing::info!("using default configuration");
            WorkerConfig::default()
        }
    };

    if let Some(server) = &args.server {
        let (host, port) = server
            .rsplit_once(':')
            .context("--server expects host:port")?;
        config.server.host = host.to_string();
        config.server.port = port.parse().context("invalid --server port")?;
    }
    if let Some(token) = args.token {
        config.token = token;
    }

    if config.token.is_empty() {
        anyhow::bail!("no token configured; set `token` in the config or pass --token");
    }

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let docker = if config.docker.enabled {
        match DockerRuntime::connect(&config.docker.socket).await {
            Ok(runtime) => Some(Arc::new(runtime) as Arc<dyn uruflow_worker::ContainerRuntime>),
            Err(e) => {
                tracing::warn!("docker unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let deployer = Arc::new(GitDeployer::new(config.work_dir()));
    let probe = Arc::new(SysinfoProbe::new());

    let session = Arc::new(WorkerSession::new(config, deployer, probe, docker));

    let stop = session.stop_token();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        tracing::info!("shutdown signal received");
        stop.cancel();
    });

    session.run().await;
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
