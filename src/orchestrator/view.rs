//! Snapshot of session state published to the presentation layer.

use serde::Serialize;

/// Position within the test layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Position {
    /// Zero-based section.
    pub section_index: usize,
    /// Zero-based question within the section.
    pub question_index: usize,
    /// Selected sub-question label for multi-part questions.
    pub sub_question_label: Option<String>,
}

/// Everything the presentation layer renders. Published over a
/// `tokio::sync::watch` channel on every change.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionView {
    /// Current position.
    pub position: Position,
    /// Id of the question at [`position`](Self::position).
    pub question_id: Option<String>,
    /// Answer at the current position.
    pub current_answer: Option<String>,
    /// Flagged question ids.
    pub flags: Vec<String>,
    /// Seconds left in the current section.
    pub time_remaining: u64,
    /// Heartbeat connection indicator.
    pub is_connected: bool,
    /// A flush is in progress.
    pub is_syncing: bool,
    /// A sibling instance announced a claim on this session.
    pub is_invalidated: bool,
    /// The record names another instance as owner.
    pub session_taken_over: bool,
    /// Most recent submission failure.
    pub submit_error: Option<String>,
    /// The submission retry window elapsed without success.
    pub is_submit_timed_out: bool,
    /// A submission is in flight, or timed out awaiting a retry.
    pub is_submitting: bool,
    /// Result id once submitted.
    pub result_id: Option<String>,
    /// An expiry-triggered submission is queued for when connectivity returns.
    pub pending_auto_submit: bool,
    /// Whether the local queue survives a restart.
    pub durable_queue: bool,
    /// The session has been submitted.
    pub is_completed: bool,
}
