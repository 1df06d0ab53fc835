//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Queue flush scheduling and retry policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    /// Quiet period after the last queued action before a flush starts.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Total flush attempts (first try included) before waiting for the next trigger.
    #[serde(default = "default_max_flush_attempts")]
    pub max_flush_attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound for a single retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1_000
}

fn default_max_flush_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    16_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_flush_attempts: default_max_flush_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Time budgets applied to every remote read and write.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Remote read budget.
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
    /// Remote write / transaction budget.
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,
}

fn default_read_ms() -> u64 {
    10_000
}

fn default_write_ms() -> u64 {
    15_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_ms: default_read_ms(),
            write_ms: default_write_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Read budget as a [`Duration`].
    #[must_use]
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    /// Write budget as a [`Duration`].
    #[must_use]
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }
}

/// Heartbeat cadence and connectivity threshold.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Interval between ownership checks.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive failures before the session is reported disconnected.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Duplicate-instance claim settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClaimConfig {
    /// Delay between announcing a claim and writing the ownership token.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_settle_ms() -> u64 {
    500
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
        }
    }
}

/// Submission retry window.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SubmissionConfig {
    /// Pause between failed submission attempts.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Elapsed time after which the submission is reported as timed out.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_retry_interval_ms() -> u64 {
    2_000
}

fn default_window_ms() -> u64 {
    30_000
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_retry_interval_ms(),
            window_ms: default_window_ms(),
        }
    }
}

/// Countdown timer settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimerConfig {
    /// Wall-clock length of one countdown tick (one timer second).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Emit a `TIMER_SYNC` queue item every this many ticks.
    #[serde(default = "default_sync_interval_seconds")]
    pub sync_interval_seconds: u64,
}

fn default_tick_ms() -> u64 {
    1_000
}

fn default_sync_interval_seconds() -> u64 {
    30
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            sync_interval_seconds: default_sync_interval_seconds(),
        }
    }
}

fn default_queue_db_path() -> PathBuf {
    PathBuf::from(".exam-sync/queue.db")
}

fn default_record_db_path() -> PathBuf {
    PathBuf::from(".exam-sync/records.db")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Local durable queue database (per machine, survives restarts).
    #[serde(default = "default_queue_db_path")]
    pub queue_db_path: PathBuf,
    /// Shared session record database standing in for the remote store.
    #[serde(default = "default_record_db_path")]
    pub record_db_path: PathBuf,
    /// Flush scheduling.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Remote operation budgets.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Heartbeat cadence.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Claim settle delay.
    #[serde(default)]
    pub claim: ClaimConfig,
    /// Submission retry policy.
    #[serde(default)]
    pub submission: SubmissionConfig,
    /// Countdown timer.
    #[serde(default)]
    pub timer: TimerConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            queue_db_path: default_queue_db_path(),
            record_db_path: default_record_db_path(),
            sync: SyncConfig::default(),
            timeouts: TimeoutConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            claim: ClaimConfig::default(),
            submission: SubmissionConfig::default(),
            timer: TimerConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would turn a loop into a busy spin or disable a guarantee.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 10] = [
            ("sync.debounce_ms", self.sync.debounce_ms),
            ("sync.max_flush_attempts", u64::from(self.sync.max_flush_attempts)),
            ("sync.backoff_base_ms", self.sync.backoff_base_ms),
            ("timeouts.read_ms", self.timeouts.read_ms),
            ("timeouts.write_ms", self.timeouts.write_ms),
            ("heartbeat.interval_ms", self.heartbeat.interval_ms),
            (
                "heartbeat.failure_threshold",
                u64::from(self.heartbeat.failure_threshold),
            ),
            ("submission.retry_interval_ms", self.submission.retry_interval_ms),
            ("timer.tick_ms", self.timer.tick_ms),
            ("timer.sync_interval_seconds", self.timer.sync_interval_seconds),
        ];

        if let Some((name, _)) = checks.iter().find(|(_, value)| *value == 0) {
            return Err(AppError::Config(format!("{name} must be greater than zero")));
        }

        if self.sync.max_backoff_ms < self.sync.backoff_base_ms {
            return Err(AppError::Config(
                "sync.max_backoff_ms must not be below sync.backoff_base_ms".into(),
            ));
        }

        Ok(())
    }
}
