//! Unit tests for configuration parsing and validation.

use std::path::PathBuf;
use std::time::Duration;

use exam_session_sync::config::GlobalConfig;
use exam_session_sync::AppError;

#[test]
fn empty_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config is valid");

    assert_eq!(config, GlobalConfig::default());
    assert_eq!(config.queue_db_path, PathBuf::from(".exam-sync/queue.db"));
    assert_eq!(config.sync.debounce_ms, 1_000);
    assert_eq!(config.sync.max_flush_attempts, 5);
    assert_eq!(config.sync.backoff_base_ms, 2_000);
    assert_eq!(config.sync.max_backoff_ms, 16_000);
    assert_eq!(config.timeouts.read(), Duration::from_secs(10));
    assert_eq!(config.timeouts.write(), Duration::from_secs(15));
    assert_eq!(config.heartbeat.interval_ms, 15_000);
    assert_eq!(config.heartbeat.failure_threshold, 3);
    assert_eq!(config.claim.settle_ms, 500);
    assert_eq!(config.submission.retry_interval_ms, 2_000);
    assert_eq!(config.submission.window_ms, 30_000);
    assert_eq!(config.timer.tick_ms, 1_000);
    assert_eq!(config.timer.sync_interval_seconds, 30);
}

#[test]
fn partial_sections_keep_remaining_defaults() {
    let toml = r#"
queue_db_path = "/tmp/q.db"

[sync]
debounce_ms = 250

[heartbeat]
interval_ms = 5000
"#;
    let config = GlobalConfig::from_toml_str(toml).expect("valid config");

    assert_eq!(config.queue_db_path, PathBuf::from("/tmp/q.db"));
    assert_eq!(config.sync.debounce_ms, 250);
    assert_eq!(config.sync.max_flush_attempts, 5);
    assert_eq!(config.heartbeat.interval_ms, 5_000);
    assert_eq!(config.heartbeat.failure_threshold, 3);
}

#[test]
fn zero_interval_is_rejected() {
    let err = GlobalConfig::from_toml_str("[heartbeat]\ninterval_ms = 0\n")
        .expect_err("zero interval must fail");

    assert!(
        matches!(err, AppError::Config(ref msg) if msg.contains("heartbeat.interval_ms")),
        "unexpected error: {err}"
    );
}

#[test]
fn backoff_cap_below_base_is_rejected() {
    let toml = "[sync]\nbackoff_base_ms = 4000\nmax_backoff_ms = 1000\n";
    let err = GlobalConfig::from_toml_str(toml).expect_err("cap below base must fail");

    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("max_backoff_ms")));
}

#[test]
fn malformed_toml_is_config_error() {
    let err = GlobalConfig::from_toml_str("[sync\n").expect_err("malformed toml");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn load_from_missing_path_fails() {
    let err = GlobalConfig::load_from_path("/definitely/not/here.toml")
        .expect_err("missing file must fail");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("failed to read config")));
}
