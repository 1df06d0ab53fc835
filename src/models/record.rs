//! Remote session record shared by every process working on one attempt.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::annotation::{AnnotationMaps, Highlight};
use super::layout::TestLayout;

/// Lifecycle status of a session attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Record exists but the student has not begun.
    NotStarted,
    /// Student is answering.
    InProgress,
    /// Attempt suspended (proctor or student pause).
    Paused,
    /// Submitted; terminal.
    Completed,
}

/// Stored answer for a question: either one value or one value per
/// labelled sub-question. `None` marks a cleared answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Answer {
    /// Single-part question.
    Single(Option<String>),
    /// Multi-part question keyed by sub-question label.
    Parts(BTreeMap<String, Option<String>>),
}

/// Deterministic session identifier for one (user, test) attempt.
#[must_use]
pub fn session_id_for(user_id: &str, test_id: &str) -> String {
    format!("{user_id}_{test_id}")
}

/// Session document as stored in the remote record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session identifier (see [`session_id_for`]).
    pub id: String,
    /// Student taking the test.
    pub user_id: String,
    /// Test being taken.
    pub test_id: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Zero-based current section.
    #[serde(default)]
    pub current_section_index: usize,
    /// Zero-based current question within the section.
    #[serde(default)]
    pub current_question_index: usize,
    /// Currently selected sub-question label.
    #[serde(default)]
    pub current_sub_question_label: Option<String>,
    /// Answers keyed by question id.
    #[serde(default)]
    pub answers: BTreeMap<String, Answer>,
    /// Questions marked for review.
    #[serde(default)]
    pub flagged_questions: Vec<String>,
    /// Highlights keyed by question id.
    #[serde(default)]
    pub annotations: BTreeMap<String, Vec<Highlight>>,
    /// Struck-through choices keyed by question id.
    #[serde(default)]
    pub strikethroughs: BTreeMap<String, Vec<String>>,
    /// Remaining seconds keyed by section index.
    #[serde(default)]
    pub section_time_remaining: BTreeMap<String, u64>,
    /// Token of the process currently considered the writer.
    #[serde(default)]
    pub ownership_token: Option<String>,
    /// Last ownership re-assertion (server clock).
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Last flushed mutation (server clock).
    #[serde(default)]
    pub last_action: Option<DateTime<Utc>>,
    /// First activation (server clock).
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Submission time (server clock).
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Fresh record for a first attempt, with every section's full time allowance.
    #[must_use]
    pub fn new(user_id: &str, test_id: &str, layout: &TestLayout) -> Self {
        let section_time_remaining = layout
            .sections
            .iter()
            .enumerate()
            .map(|(index, section)| (index.to_string(), section.time_limit_seconds))
            .collect();

        Self {
            id: session_id_for(user_id, test_id),
            user_id: user_id.to_owned(),
            test_id: test_id.to_owned(),
            status: SessionStatus::NotStarted,
            current_section_index: 0,
            current_question_index: 0,
            current_sub_question_label: None,
            answers: BTreeMap::new(),
            flagged_questions: Vec::new(),
            annotations: BTreeMap::new(),
            strikethroughs: BTreeMap::new(),
            section_time_remaining,
            ownership_token: None,
            last_heartbeat: None,
            last_action: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the attempt has been submitted.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (
                SessionStatus::NotStarted | SessionStatus::Paused,
                SessionStatus::InProgress
            ) | (
                SessionStatus::InProgress,
                SessionStatus::Paused | SessionStatus::Completed
            ) | (SessionStatus::Paused, SessionStatus::Completed)
        )
    }

    /// Current answer for a question or sub-question.
    #[must_use]
    pub fn answer_for(&self, question_id: &str, sub_question_label: Option<&str>) -> Option<&str> {
        match (self.answers.get(question_id)?, sub_question_label) {
            (Answer::Single(value), None) => value.as_deref(),
            (Answer::Parts(parts), Some(label)) => parts.get(label)?.as_deref(),
            _ => None,
        }
    }

    /// Set or clear an answer the same way a dot-path write would: a labelled
    /// write over a single value replaces it with a part map.
    pub fn set_answer(
        &mut self,
        question_id: &str,
        sub_question_label: Option<&str>,
        value: Option<String>,
    ) {
        match sub_question_label {
            None => {
                self.answers
                    .insert(question_id.to_owned(), Answer::Single(value));
            }
            Some(label) => {
                let entry = self
                    .answers
                    .entry(question_id.to_owned())
                    .or_insert_with(|| Answer::Parts(BTreeMap::new()));
                if let Answer::Parts(parts) = entry {
                    parts.insert(label.to_owned(), value);
                } else {
                    *entry = Answer::Parts(BTreeMap::from([(label.to_owned(), value)]));
                }
            }
        }
    }

    /// Whether a question is currently flagged.
    #[must_use]
    pub fn is_flagged(&self, question_id: &str) -> bool {
        self.flagged_questions.iter().any(|q| q == question_id)
    }

    /// Add or remove a question from the flagged set.
    pub fn set_flag(&mut self, question_id: &str, flagged: bool) {
        apply_flag(&mut self.flagged_questions, question_id, flagged);
    }

    /// Copy of the annotation maps.
    #[must_use]
    pub fn annotation_maps(&self) -> AnnotationMaps {
        AnnotationMaps {
            annotations: self.annotations.clone(),
            strikethroughs: self.strikethroughs.clone(),
        }
    }

    /// Replace the annotation maps.
    pub fn set_annotation_maps(&mut self, maps: AnnotationMaps) {
        self.annotations = maps.annotations;
        self.strikethroughs = maps.strikethroughs;
    }

    /// Remaining seconds for a section, if a checkpoint exists.
    #[must_use]
    pub fn time_remaining(&self, section_index: usize) -> Option<u64> {
        self.section_time_remaining
            .get(&section_index.to_string())
            .copied()
    }
}

/// Set union / difference of one question against a flag list, keeping
/// the existing order and never duplicating an entry.
pub fn apply_flag(flags: &mut Vec<String>, question_id: &str, flagged: bool) {
    let present = flags.iter().any(|q| q == question_id);
    if flagged && !present {
        flags.push(question_id.to_owned());
    } else if !flagged && present {
        flags.retain(|q| q != question_id);
    }
}
