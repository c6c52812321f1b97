//! Configuration Module
//!
//! Provides TOML-based configuration for VibeBus with support for:
//! - Service settings (id, default subtopic separator, client queues)
//! - Destinations with routing mode, subtopic rules and throttling
//! - Cluster membership and subscription sync
//! - Prometheus metrics endpoint
//! - Environment variable overrides (VIBEBUS_* prefix)

use std::collections::HashSet;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use cluster::ClusterConfig;
pub use destination::DestinationConfig;
pub use metrics::MetricsConfig;

use crate::protocol::MAX_PRIORITY;
use crate::topic::validate_separator;

mod cluster;
mod destination;
mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Message service configuration
    pub service: ServiceConfig,
    /// Destinations, one `[[destination]]` table each
    #[serde(rename = "destination")]
    pub destinations: Vec<DestinationConfig>,
    /// Cluster configuration (only first entry is used if multiple)
    pub cluster: Vec<ClusterConfig>,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Message service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service id, for logs
    #[serde(default = "default_service_id")]
    pub id: String,
    /// Subtopic separator for destinations that set none
    #[serde(default = "default_subtopic_separator")]
    pub subtopic_separator: String,
    /// Messages held per client until polled; excess is dropped
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

fn default_service_id() -> String {
    "message-service".to_string()
}
fn default_subtopic_separator() -> String {
    ".".to_string()
}
fn default_outbound_queue_capacity() -> usize {
    1000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            id: default_service_id(),
            subtopic_separator: default_subtopic_separator(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBEBUS__` prefix with double underscores for nesting:
    ///    - `VIBEBUS__SERVICE__ID=edge-1` overrides `service.id`
    ///    - `VIBEBUS__METRICS__ENABLED=true` overrides `metrics.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("service.id", default_service_id())?
            .set_default("service.subtopic_separator", default_subtopic_separator())?
            .set_default(
                "service.outbound_queue_capacity",
                default_outbound_queue_capacity() as u64,
            )?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEBUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// The cluster section, when clustering is enabled
    pub fn cluster(&self) -> Option<&ClusterConfig> {
        self.cluster.first().filter(|c| c.enabled)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_separator(&self.service.subtopic_separator).map_err(|e| {
            ConfigError::Validation(format!("service.subtopic_separator: {}", e))
        })?;

        let mut ids = HashSet::new();
        for destination in &self.destinations {
            if destination.id.is_empty() {
                return Err(ConfigError::Validation(
                    "destination id must not be empty".to_string(),
                ));
            }
            if !ids.insert(destination.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate destination '{}'",
                    destination.id
                )));
            }
            if let Some(ref separator) = destination.subtopic_separator {
                validate_separator(separator).map_err(|e| {
                    ConfigError::Validation(format!(
                        "destination '{}' subtopic_separator: {}",
                        destination.id, e
                    ))
                })?;
            }
            if destination.priority.is_some_and(|p| p > MAX_PRIORITY) {
                return Err(ConfigError::Validation(format!(
                    "destination '{}' priority must be 0..={}",
                    destination.id, MAX_PRIORITY
                )));
            }
        }

        Ok(())
    }
}
