//! Destination Configuration

use std::time::Duration;

use serde::Deserialize;

use crate::broker::RoutingMode;
use crate::throttle::ThrottleConfig;

/// Settings for one destination, from a `[[destination]]` table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Unique destination id
    pub id: String,
    /// How published messages reach other nodes
    pub routing_mode: RoutingMode,
    /// Whether the destination takes part in clustering at all
    pub clustered: bool,
    /// Overrides the service-wide subtopic separator
    pub subtopic_separator: Option<String>,
    /// Whether subtopics may be used on this destination
    #[serde(default = "default_true")]
    pub allow_subtopics: bool,
    /// Reject subscriptions whose subtopic contains a wildcard
    pub disallow_wildcard_subtopics: bool,
    /// Time-to-live stamped on every published message
    #[serde(default, with = "humantime_serde")]
    pub message_ttl: Option<Duration>,
    /// Priority applied to delivered messages that carry none
    pub priority: Option<u8>,
    /// Rate limits
    pub throttle: ThrottleConfig,
}

fn default_true() -> bool {
    true
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            routing_mode: RoutingMode::default(),
            clustered: false,
            subtopic_separator: None,
            allow_subtopics: true,
            disallow_wildcard_subtopics: false,
            message_ttl: None,
            priority: None,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl DestinationConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// A destination clustered with the given routing mode
    pub fn clustered(id: impl Into<String>, routing_mode: RoutingMode) -> Self {
        Self {
            clustered: true,
            routing_mode,
            ..Self::new(id)
        }
    }
}
