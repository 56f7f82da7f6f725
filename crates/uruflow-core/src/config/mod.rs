//! Configuration management
//!
//! Both endpoints load TOML files with serde defaults, so partial configs
//! work and new fields do not break existing installs.

mod coordinator;
mod worker;

pub use coordinator::{
    CoordinatorConfig, ListenConfig, TimeoutsConfig, TlsConfig, WorkerCredential,
};
pub use worker::{DockerConfig, UpstreamConfig, WorkerConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Default configuration directory for the current user
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("uruflow")
}

/// Load a configuration file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save a configuration file, creating parent directories as needed
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}
