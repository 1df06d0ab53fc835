//! Test layout: sections, time limits and question order.
//!
//! The layout is authored elsewhere; this crate only needs enough of it to
//! move through questions and seed section countdowns.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::{AppError, Result};

/// A question reference within a section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct QuestionRef {
    /// Question identifier; used as a record field key, so it may not contain `.`.
    pub id: String,
    /// Labels of the question's parts, empty for single-part questions.
    #[serde(default)]
    pub sub_questions: Vec<String>,
}

impl QuestionRef {
    /// Label selected when the question is first entered.
    #[must_use]
    pub fn first_label(&self) -> Option<String> {
        self.sub_questions.first().cloned()
    }
}

/// One timed section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SectionLayout {
    /// Display name.
    pub name: String,
    /// Countdown length in seconds.
    pub time_limit_seconds: u64,
    /// Questions in display order.
    pub questions: Vec<QuestionRef>,
}

/// Ordered sections of a test.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TestLayout {
    /// Test identifier.
    pub test_id: String,
    /// Sections in the order they are taken.
    pub sections: Vec<SectionLayout>,
}

impl TestLayout {
    /// Load and validate a layout from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, parsed or validated.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read layout: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a layout from TOML.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let layout: Self = toml::from_str(raw)?;
        layout.validate()?;
        Ok(layout)
    }

    /// Check structural rules the sync engine relies on.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.sections.is_empty() {
            return Err(AppError::Config("layout must have at least one section".into()));
        }

        let mut seen = HashSet::new();
        for section in &self.sections {
            if section.questions.is_empty() {
                return Err(AppError::Config(format!(
                    "section {} has no questions",
                    section.name
                )));
            }
            if section.time_limit_seconds == 0 {
                return Err(AppError::Config(format!(
                    "section {} must have a positive time limit",
                    section.name
                )));
            }
            for question in &section.questions {
                if question.id.is_empty() || question.id.contains('.') {
                    return Err(AppError::Config(format!(
                        "invalid question id: {:?}",
                        question.id
                    )));
                }
                if !seen.insert(question.id.as_str()) {
                    return Err(AppError::Config(format!(
                        "duplicate question id: {}",
                        question.id
                    )));
                }
                if let Some(label) = question
                    .sub_questions
                    .iter()
                    .find(|label| label.is_empty() || label.contains('.'))
                {
                    return Err(AppError::Config(format!(
                        "invalid sub-question label {label:?} on {}",
                        question.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Section at `index`.
    #[must_use]
    pub fn section(&self, index: usize) -> Option<&SectionLayout> {
        self.sections.get(index)
    }

    /// Question at a position.
    #[must_use]
    pub fn question(&self, section_index: usize, question_index: usize) -> Option<&QuestionRef> {
        self.section(section_index)?.questions.get(question_index)
    }

    /// Look up a question anywhere in the test.
    #[must_use]
    pub fn find_question(&self, question_id: &str) -> Option<&QuestionRef> {
        self.sections
            .iter()
            .flat_map(|section| section.questions.iter())
            .find(|question| question.id == question_id)
    }

    /// Whether `index` is the last section.
    #[must_use]
    pub fn is_last_section(&self, index: usize) -> bool {
        index + 1 >= self.sections.len()
    }
}
