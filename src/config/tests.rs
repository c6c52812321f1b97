//! Config module tests

use std::time::Duration;

use super::*;
use crate::broker::RoutingMode;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    std::env::set_var("TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("vibebus.toml");

    std::env::set_var("TEST_SERVICE_ID", "edge-7");

    let config_content = r#"
[service]
id = "${TEST_SERVICE_ID}"
outbound_queue_capacity = ${TEST_QUEUE_CAPACITY:-64}

[[destination]]
id = "feed"
"#;
    std::fs::write(&config_path, config_content).unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.service.id, "edge-7");
    assert_eq!(config.service.outbound_queue_capacity, 64);
    assert_eq!(config.service.subtopic_separator, ".");
    assert_eq!(config.destinations.len(), 1);

    std::env::remove_var("TEST_SERVICE_ID");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.service.id, "message-service");
    assert!(config.destinations.is_empty());
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.service.subtopic_separator, ".");
    assert_eq!(config.service.outbound_queue_capacity, 1000);
    assert!(config.cluster().is_none());
    assert!(!config.metrics.enabled);
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[service]
id = "bus"
subtopic_separator = "/"

[[destination]]
id = "quotes"
clustered = true
routing_mode = "SERVER_TO_SERVER"
priority = 4

[[destination]]
id = "alerts"
clustered = true
routing_mode = "broadcast"
message_ttl = "1m"

[[cluster]]
enabled = true
node_id = "bus-1"

[metrics]
enabled = true
bind = "127.0.0.1:9100"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.service.subtopic_separator, "/");
    assert_eq!(config.destinations[0].routing_mode, RoutingMode::ServerToServer);
    assert_eq!(config.destinations[0].priority, Some(4));
    assert_eq!(config.destinations[1].routing_mode, RoutingMode::Broadcast);
    assert_eq!(
        config.destinations[1].message_ttl,
        Some(Duration::from_secs(60))
    );
    assert_eq!(
        config.cluster().and_then(|c| c.node_id.as_deref()),
        Some("bus-1")
    );
    assert_eq!(config.metrics.bind.port(), 9100);
}

#[test]
fn test_disabled_cluster_section_is_ignored() {
    let config = Config::parse("[[cluster]]\nenabled = false\n").unwrap();
    assert!(config.cluster().is_none());
}

#[test]
fn test_validate_duplicate_destination() {
    let result = Config::parse(
        r#"
[[destination]]
id = "feed"

[[destination]]
id = "feed"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validate_empty_destination_id() {
    let result = Config::parse("[[destination]]\nrouting_mode = \"none\"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validate_separator() {
    let result = Config::parse("[service]\nsubtopic_separator = \"\"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));

    let result = Config::parse("[[destination]]\nid = \"feed\"\nsubtopic_separator = \"*\"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validate_priority() {
    let result = Config::parse("[[destination]]\nid = \"feed\"\npriority = 12\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_unknown_routing_mode_is_rejected() {
    let result = Config::parse("[[destination]]\nid = \"feed\"\nrouting_mode = \"mesh\"\n");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}
