//! Submission metadata and the scored-result document it produces.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::Answer;

/// What caused a submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmitTrigger {
    /// Student pressed submit.
    Manual,
    /// Final section countdown reached zero.
    TimerExpired,
    /// A deferred `AUTO_SUBMIT` item was replayed after reconnecting.
    Recovered,
}

/// Client-side context sent with a result creation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionMetadata {
    /// Student.
    pub user_id: String,
    /// Test.
    pub test_id: String,
    /// Submission cause.
    pub trigger: SubmitTrigger,
    /// Process that submitted.
    pub instance_token: String,
    /// Local clock at the first submission attempt.
    pub client_submitted_at: DateTime<Utc>,
}

/// Deterministic result identifier; repeated submissions map to one result.
#[must_use]
pub fn result_id_for(session_id: &str) -> String {
    format!("result_{session_id}")
}

/// Result document created once per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    /// See [`result_id_for`].
    pub id: String,
    /// Session that was submitted.
    pub session_id: String,
    /// Answers as recorded at submission.
    #[serde(default)]
    pub answers: BTreeMap<String, Answer>,
    /// Flags as recorded at submission.
    #[serde(default)]
    pub flagged_questions: Vec<String>,
    /// Submission context from the first successful request.
    pub metadata: SubmissionMetadata,
    /// Server time the result was created.
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}
