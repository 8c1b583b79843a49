use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;
use crate::session::QueuePolicy;

#[test]
fn defaults_without_file() {
    let config = Config::parse("").unwrap();

    assert_eq!(config.log.level, "info");
    assert_eq!(config.limits.max_inflight, 32);
    assert_eq!(config.limits.max_queued, 1000);
    assert_eq!(config.limits.queue_policy, QueuePolicy::DropOldest);
    assert_eq!(config.limits.retry_interval, Duration::from_secs(30));
    assert_eq!(config.limits.max_retries, 5);
    assert_eq!(config.session.default_keep_alive, 60);
    assert_eq!(config.session.default_expiry, Duration::from_secs(3600));
    assert_eq!(config.mqtt.max_qos, 2);
    assert!(config.mqtt.retain_available);
}

#[test]
fn parse_full_document() {
    let config = Config::parse(
        r#"
        [log]
        level = "debug"

        [limits]
        max_connections = 5000
        max_inflight = 16
        max_queued = 50
        queue_policy = "drop-newest"
        retry_interval = "5s"
        max_retries = 3
        outbound_buffer = 256

        [session]
        default_keep_alive = 30
        default_expiry = "10m"
        sweep_interval = "15s"

        [mqtt]
        max_qos = 1
        retain_available = false
        wildcard_subscriptions = false
        allow_anonymous = false
        "#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.limits.max_connections, 5000);
    assert_eq!(config.limits.queue_policy, QueuePolicy::DropNewest);
    assert_eq!(config.limits.retry_interval, Duration::from_secs(5));
    assert_eq!(config.session.default_expiry, Duration::from_secs(600));
    assert_eq!(config.session.sweep_interval, Duration::from_secs(15));
    assert_eq!(config.mqtt.max_qos, 1);
    assert!(!config.mqtt.retain_available);
    assert!(!config.mqtt.allow_anonymous);
}

#[test]
fn rejects_invalid_max_qos() {
    let err = Config::parse("[mqtt]\nmax_qos = 3\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn rejects_zero_inflight() {
    let err = Config::parse("[limits]\nmax_inflight = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn env_substitution_with_defaults() {
    let content = "[log]\nlevel = \"${EMBERMQ_TEST_UNSET_LEVEL:-warn}\"\n";
    let substituted = substitute_env_vars(content);
    assert_eq!(substituted, "[log]\nlevel = \"warn\"\n");
}

#[test]
fn env_substitution_reads_variable() {
    std::env::set_var("EMBERMQ_TEST_SET_LEVEL", "trace");
    let substituted = substitute_env_vars("level = \"${EMBERMQ_TEST_SET_LEVEL}\"");
    assert_eq!(substituted, "level = \"trace\"");
    std::env::remove_var("EMBERMQ_TEST_SET_LEVEL");
}

#[test]
fn load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.limits.max_inflight, 32);
}

#[test]
fn load_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.toml");
    std::fs::write(&path, "[limits]\nmax_queued = 7\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.limits.max_queued, 7);
    // Untouched sections keep defaults
    assert_eq!(config.session.default_keep_alive, 60);
}
