//! Queue item model: one durable record per pending local mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::annotation::AnnotationOp;
use crate::{AppError, Result};

/// Discriminant of a queued action, stored alongside the payload for filtering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Answer value set or cleared.
    AnswerChange,
    /// Review flag set or cleared.
    FlagToggle,
    /// Position change.
    Navigation,
    /// Periodic remaining-time checkpoint.
    TimerSync,
    /// Highlight / strikethrough edit.
    AnnotationUpdate,
    /// Timer expired while offline; submission must be replayed.
    AutoSubmit,
}

impl ActionType {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnswerChange => "ANSWER_CHANGE",
            Self::FlagToggle => "FLAG_TOGGLE",
            Self::Navigation => "NAVIGATION",
            Self::TimerSync => "TIMER_SYNC",
            Self::AnnotationUpdate => "ANNOTATION_UPDATE",
            Self::AutoSubmit => "AUTO_SUBMIT",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an unknown action type.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "ANSWER_CHANGE" => Ok(Self::AnswerChange),
            "FLAG_TOGGLE" => Ok(Self::FlagToggle),
            "NAVIGATION" => Ok(Self::Navigation),
            "TIMER_SYNC" => Ok(Self::TimerSync),
            "ANNOTATION_UPDATE" => Ok(Self::AnnotationUpdate),
            "AUTO_SUBMIT" => Ok(Self::AutoSubmit),
            other => Err(AppError::Db(format!("invalid action type: {other}"))),
        }
    }
}

/// Answer edit for a question or one of its labelled sub-questions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerChange {
    /// Question the answer belongs to.
    pub question_id: String,
    /// Sub-question label, `None` for single-part questions.
    pub sub_question_label: Option<String>,
    /// New value; `None` clears the answer.
    pub value: Option<String>,
}

/// Absolute flag state for a question (not a relative flip).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagToggle {
    /// Question being flagged or unflagged.
    pub question_id: String,
    /// Desired flag state.
    pub flagged: bool,
}

/// Position after a navigation command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Navigation {
    /// Zero-based section index.
    pub section_index: usize,
    /// Zero-based question index within the section.
    pub question_index: usize,
    /// Selected sub-question, if the question has parts.
    pub sub_question_label: Option<String>,
}

/// Remaining time checkpoint for a section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerSync {
    /// Section the countdown belongs to.
    pub section_index: usize,
    /// Seconds left on the countdown.
    pub remaining_seconds: u64,
}

/// Order-sensitive annotation edit on one question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnotationUpdate {
    /// Question whose annotations are edited.
    pub question_id: String,
    /// The edit to replay.
    pub op: AnnotationOp,
}

/// Deferred timer-expiry submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoSubmit {
    /// Section whose countdown expired.
    pub section_index: usize,
}

/// Queued action with a payload typed per action kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "action_type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE"
)]
pub enum QueueAction {
    /// See [`AnswerChange`].
    AnswerChange(AnswerChange),
    /// See [`FlagToggle`].
    FlagToggle(FlagToggle),
    /// See [`Navigation`].
    Navigation(Navigation),
    /// See [`TimerSync`].
    TimerSync(TimerSync),
    /// See [`AnnotationUpdate`].
    AnnotationUpdate(AnnotationUpdate),
    /// See [`AutoSubmit`].
    AutoSubmit(AutoSubmit),
}

impl QueueAction {
    /// Discriminant of this action.
    #[must_use]
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::AnswerChange(_) => ActionType::AnswerChange,
            Self::FlagToggle(_) => ActionType::FlagToggle,
            Self::Navigation(_) => ActionType::Navigation,
            Self::TimerSync(_) => ActionType::TimerSync,
            Self::AnnotationUpdate(_) => ActionType::AnnotationUpdate,
            Self::AutoSubmit(_) => ActionType::AutoSubmit,
        }
    }
}

/// Lifecycle of a queue item. Deletion is confirmation, so there is no
/// "confirmed" variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    /// Awaiting a successful flush.
    Pending,
}

/// A durable record of one pending local mutation awaiting remote merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    /// Unique item identifier (UUID v4 prefixed `q:`).
    pub id: String,
    /// Session the mutation applies to.
    pub session_id: String,
    /// Local clock reading when the user acted; drives last-write-wins.
    pub local_timestamp: DateTime<Utc>,
    /// Typed action and payload.
    pub action: QueueAction,
    /// Current lifecycle status.
    pub status: QueueStatus,
}

impl QueueItem {
    /// Construct a pending item stamped with the current local time.
    #[must_use]
    pub fn new(session_id: impl Into<String>, action: QueueAction) -> Self {
        Self::at(session_id, action, Utc::now())
    }

    /// Construct a pending item with an explicit local timestamp.
    #[must_use]
    pub fn at(
        session_id: impl Into<String>,
        action: QueueAction,
        local_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("q:{}", Uuid::new_v4()),
            session_id: session_id.into(),
            local_timestamp,
            action,
            status: QueueStatus::Pending,
        }
    }

    /// Discriminant of the carried action.
    #[must_use]
    pub fn action_type(&self) -> ActionType {
        self.action.action_type()
    }
}
