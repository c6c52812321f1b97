//! Metrics exposition settings

use std::net::SocketAddr;

use serde::Deserialize;

/// `[metrics]` section; the exporter only runs when enabled
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Serves `/metrics`, `/health` and `/ready`
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}
