//! Configuration management for the voice bridge
//!
//! Supports loading configuration from:
//! - TOML files
//! - Environment variables (VOICEBRIDGE_ prefix, `__` as separator)
//!
//! All configuration is read-only after process start.

pub mod settings;

pub use settings::{
    load_settings, BackoffConfig, ObservabilityConfig, OrchestratorConfig, RateTable,
    RegistryConfig, SentenceConfig, ServerConfig, Settings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
