//! Highlight and strikethrough annotations and their index-based edits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A highlighted character range in a question's text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Highlight {
    /// Start offset (inclusive).
    pub start: usize,
    /// End offset (exclusive).
    pub end: usize,
    /// Display colour name.
    pub color: String,
}

/// One annotation edit. Highlight removal is by array index, so edits only
/// make sense when replayed in the order they were made.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnnotationOp {
    /// Append a highlight.
    AddHighlight {
        /// Highlight to append.
        highlight: Highlight,
    },
    /// Remove the highlight at `index`.
    RemoveHighlight {
        /// Position in the question's highlight list.
        index: usize,
    },
    /// Remove every highlight on the question.
    ClearHighlights,
    /// Strike an answer choice, or un-strike it if already struck.
    ToggleStrikethrough {
        /// Answer choice identifier.
        choice: String,
    },
    /// Remove every strikethrough on the question.
    ClearStrikethroughs,
    /// Remove both highlights and strikethroughs on the question.
    ClearAll,
}

/// Per-question highlight and strikethrough maps as stored on the session record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnotationMaps {
    /// Highlights keyed by question id.
    #[serde(default)]
    pub annotations: BTreeMap<String, Vec<Highlight>>,
    /// Struck-through choices keyed by question id.
    #[serde(default)]
    pub strikethroughs: BTreeMap<String, Vec<String>>,
}

impl AnnotationMaps {
    /// Apply one edit. Returns `false` when the edit referenced a highlight
    /// index that no longer exists and was skipped.
    pub fn apply(&mut self, question_id: &str, op: &AnnotationOp) -> bool {
        let applied = match op {
            AnnotationOp::AddHighlight { highlight } => {
                self.annotations
                    .entry(question_id.to_owned())
                    .or_default()
                    .push(highlight.clone());
                true
            }
            AnnotationOp::RemoveHighlight { index } => {
                match self.annotations.get_mut(question_id) {
                    Some(list) if *index < list.len() => {
                        list.remove(*index);
                        true
                    }
                    _ => false,
                }
            }
            AnnotationOp::ClearHighlights => {
                self.annotations.remove(question_id);
                true
            }
            AnnotationOp::ToggleStrikethrough { choice } => {
                let struck = self
                    .strikethroughs
                    .entry(question_id.to_owned())
                    .or_default();
                if let Some(pos) = struck.iter().position(|c| c == choice) {
                    struck.remove(pos);
                } else {
                    struck.push(choice.clone());
                }
                true
            }
            AnnotationOp::ClearStrikethroughs => {
                self.strikethroughs.remove(question_id);
                true
            }
            AnnotationOp::ClearAll => {
                self.annotations.remove(question_id);
                self.strikethroughs.remove(question_id);
                true
            }
        };
        self.prune(question_id);
        applied
    }

    fn prune(&mut self, question_id: &str) {
        if self.annotations.get(question_id).is_some_and(Vec::is_empty) {
            self.annotations.remove(question_id);
        }
        if self
            .strikethroughs
            .get(question_id)
            .is_some_and(Vec::is_empty)
        {
            self.strikethroughs.remove(question_id);
        }
    }
}
