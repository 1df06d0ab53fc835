//! Unit tests for flush retry backoff.

use std::time::Duration;

use exam_session_sync::config::SyncConfig;
use exam_session_sync::sync::flush::BackoffPolicy;

#[test]
fn default_policy_doubles_from_two_seconds() {
    let policy = BackoffPolicy::from(&SyncConfig::default());

    let delays: Vec<Duration> = (1..policy.max_attempts)
        .map(|retry| policy.delay_for(retry))
        .collect();

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(16),
        ]
    );
    assert_eq!(policy.max_attempts, 5);
}

#[test]
fn delay_is_capped() {
    let policy = BackoffPolicy {
        base: Duration::from_millis(100),
        max: Duration::from_millis(250),
        max_attempts: 10,
    };

    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(250));
    assert_eq!(policy.delay_for(60), Duration::from_millis(250));
}
