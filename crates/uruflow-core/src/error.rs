//! Shared error types

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading/saving errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by store implementations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend-specific failure
    #[error("store backend error: {0}")]
    Backend(String),
}
