//! Worker daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the worker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Token issued by the coordinator operator
    pub token: String,
    pub data_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub server: UpstreamConfig,
    pub docker: DockerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("uruflow-worker");
        Self {
            token: String::new(),
            data_dir,
            log_file: None,
            server: UpstreamConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// The coordinator address to dial
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Where deploy checkouts live
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }
}

/// Coordinator endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Accept any certificate (self-signed deployments)
    pub tls_skip_verify: bool,
    /// Fixed sleep between reconnect attempts (seconds)
    pub reconnect_sec: u64,
    /// Metrics push cadence (seconds)
    pub metrics_sec: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9001,
            tls: false,
            tls_skip_verify: false,
            reconnect_sec: 5,
            metrics_sec: 10,
        }
    }
}

impl UpstreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_sec)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_sec.max(1))
    }
}

/// Docker collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub enabled: bool,
    pub socket: PathBuf,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket: PathBuf::from("/var/run/docker.sock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.reconnect_sec, 5);
        assert_eq!(config.server.metrics_sec, 10);
        assert!(config.docker.enabled);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: WorkerConfig = toml::from_str(
            r#"
            token = "secret"

            [server]
            host = "deploy.example.com"
            tls = true
            tls_skip_verify = true
            "#,
        )
        .unwrap();

        assert_eq!(config.token, "secret");
        assert_eq!(config.server.host, "deploy.example.com");
        assert!(config.server.tls);
        assert!(config.server.tls_skip_verify);
        assert_eq!(config.server.port, 9001);
    }

    #[test]
    fn test_metrics_interval_floor() {
        let config = UpstreamConfig {
            metrics_sec: 0,
            ..Default::default()
        };
        assert_eq!(config.metrics_interval(), Duration::from_secs(1));
    }
}
