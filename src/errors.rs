//! Error types shared across the session engine.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration or test layout parsing/validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Transient network failure talking to the remote record store.
    Connectivity(String),
    /// A remote operation exceeded its time budget.
    Timeout(String),
    /// Another instance now owns the session; requires explicit user action.
    Takeover(String),
    /// The local durable queue store is inaccessible.
    StoreUnavailable(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// The session has already been submitted; no further mutation is accepted.
    SessionCompleted(String),
    /// Record or payload (de)serialization failure.
    Serialization(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the failure is transient and the operation may be retried.
    ///
    /// Takeover and completion are terminal for the current attempt; the
    /// rest of the taxonomy either needs a human or a config fix.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Timeout(_) | Self::Db(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Connectivity(msg) => write!(f, "connectivity: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Takeover(msg) => write!(f, "takeover: {msg}"),
            Self::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::SessionCompleted(msg) => write!(f, "session completed: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
