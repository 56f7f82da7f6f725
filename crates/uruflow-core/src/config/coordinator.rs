//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::Repository;

/// Configuration for the coordinator daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub server: ListenConfig,
    pub tls: TlsConfig,
    /// Pre-provisioned worker token table
    pub workers: Vec<WorkerCredential>,
    /// Repositories the deployment service can deploy
    pub repositories: Vec<Repository>,
    pub timeouts: TimeoutsConfig,
}

impl CoordinatorConfig {
    /// Look up a worker credential by its token
    pub fn worker_by_token(&self, token: &str) -> Option<&WorkerCredential> {
        self.workers.iter().find(|w| w.token == token)
    }

    /// Look up a repository by name
    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.name == name)
    }

    /// The address the TCP listener binds
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.tcp_port)
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub tcp_port: u16,
    pub data_dir: PathBuf,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            tcp_port: 9001,
            data_dir: PathBuf::from("/var/lib/uruflow"),
        }
    }
}

/// TLS settings for the listener
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Generate and serve a self-signed certificate at startup
    pub auto_cert: bool,
}

/// One entry of the pre-provisioned worker table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCredential {
    pub id: String,
    pub name: String,
    pub token: String,
}

/// Protocol timeouts. Defaults match production; tests shrink them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Handshake read deadline (seconds)
    pub auth_secs: u64,
    /// Per-read idle deadline on an active session (seconds)
    pub read_idle_secs: u64,
    /// Write deadline (seconds)
    pub write_secs: u64,
    /// PING cadence (seconds)
    pub ping_interval_secs: u64,
    /// Silence threshold before a session is declared dead (seconds)
    pub pong_timeout_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            auth_secs: 10,
            read_idle_secs: 60,
            write_secs: 10,
            ping_interval_secs: 30,
            pong_timeout_secs: 45,
        }
    }
}

impl TimeoutsConfig {
    pub fn auth(&self) -> Duration {
        Duration::from_secs(self.auth_secs)
    }

    pub fn read_idle(&self) -> Duration {
        Duration::from_secs(self.read_idle_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.server.tcp_port, 9001);
        assert_eq!(config.timeouts.ping_interval_secs, 30);
        assert_eq!(config.timeouts.pong_timeout_secs, 45);
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_worker_by_token() {
        let config = CoordinatorConfig {
            workers: vec![WorkerCredential {
                id: "w1".to_string(),
                name: "prod".to_string(),
                token: "secret".to_string(),
            }],
            ..Default::default()
        };

        assert_eq!(config.worker_by_token("secret").unwrap().id, "w1");
        assert!(config.worker_by_token("nope").is_none());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
            [server]
            tcp_port = 7000

            [[workers]]
            id = "w1"
            name = "prod"
            token = "t"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.tcp_port, 7000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.timeouts.auth_secs, 10);
        assert_eq!(config.workers.len(), 1);
    }
}
