//! Merge planning: reduce a batch of pending items to the minimal remote writes.
//!
//! Answers, flags, navigation and timer checkpoints are last-write-wins by
//! local timestamp (ties go to the later insertion). Annotation edits are
//! index-based and therefore kept whole, in insertion order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::annotation::AnnotationMaps;
use crate::models::queue::{
    AnnotationUpdate, AnswerChange, Navigation, QueueAction, QueueItem, TimerSync,
};
use crate::models::record::{apply_flag, SessionRecord};
use crate::persistence::record_store::FieldWrite;
use crate::Result;

/// Grouping key used for answers without a sub-question label.
pub const SINGLE_PART_KEY: &str = "__single__";

/// Merged view of a batch of queue items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushPlan {
    /// Winning answer per `(question, label)` key, in key order.
    pub answers: Vec<AnswerChange>,
    /// Final flag state per question.
    pub flags: BTreeMap<String, bool>,
    /// Annotation edits in insertion order.
    pub annotations: Vec<AnnotationUpdate>,
    /// Latest navigation, if any.
    pub navigation: Option<Navigation>,
    /// Latest timer checkpoint, if any.
    pub timer: Option<TimerSync>,
    /// Items consumed by this plan; deleted once the writes are confirmed.
    pub consumed_ids: Vec<String>,
    /// The annotation edits among `consumed_ids`.
    pub annotation_ids: Vec<String>,
}

struct Latest<T> {
    at: DateTime<Utc>,
    value: T,
}

fn keep_latest<K: Ord, T>(slots: &mut BTreeMap<K, Latest<T>>, key: K, at: DateTime<Utc>, value: T) {
    match slots.get(&key) {
        Some(existing) if existing.at > at => {}
        _ => {
            slots.insert(key, Latest { at, value });
        }
    }
}

fn keep_latest_single<T>(slot: &mut Option<Latest<T>>, at: DateTime<Utc>, value: T) {
    if slot.as_ref().map_or(true, |existing| existing.at <= at) {
        *slot = Some(Latest { at, value });
    }
}

/// Build a plan from items listed in insertion order.
///
/// `AUTO_SUBMIT` items are left out: they are not merged and stay queued
/// for the controller.
#[must_use]
pub fn plan(items: &[QueueItem]) -> FlushPlan {
    let mut answers: BTreeMap<(String, String), Latest<AnswerChange>> = BTreeMap::new();
    let mut flags: BTreeMap<String, Latest<bool>> = BTreeMap::new();
    let mut navigation: Option<Latest<Navigation>> = None;
    let mut timer: Option<Latest<TimerSync>> = None;
    let mut annotations = Vec::new();
    let mut consumed_ids = Vec::new();
    let mut annotation_ids = Vec::new();

    for item in items {
        let at = item.local_timestamp;
        match &item.action {
            QueueAction::AnswerChange(change) => {
                let label = change
                    .sub_question_label
                    .clone()
                    .unwrap_or_else(|| SINGLE_PART_KEY.to_owned());
                keep_latest(
                    &mut answers,
                    (change.question_id.clone(), label),
                    at,
                    change.clone(),
                );
            }
            QueueAction::FlagToggle(toggle) => {
                keep_latest(&mut flags, toggle.question_id.clone(), at, toggle.flagged);
            }
            QueueAction::Navigation(nav) => keep_latest_single(&mut navigation, at, nav.clone()),
            QueueAction::TimerSync(sync) => keep_latest_single(&mut timer, at, sync.clone()),
            QueueAction::AnnotationUpdate(update) => {
                annotations.push(update.clone());
                annotation_ids.push(item.id.clone());
            }
            QueueAction::AutoSubmit(_) => continue,
        }
        consumed_ids.push(item.id.clone());
    }

    FlushPlan {
        answers: answers.into_values().map(|latest| latest.value).collect(),
        flags: flags
            .into_iter()
            .map(|(question_id, latest)| (question_id, latest.value))
            .collect(),
        annotations,
        navigation: navigation.map(|latest| latest.value),
        timer: timer.map(|latest| latest.value),
        consumed_ids,
        annotation_ids,
    }
}

impl FlushPlan {
    /// Whether the batch contained nothing to merge.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumed_ids.is_empty()
    }

    /// Plain field overwrites: answers, position and timer checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if a value cannot be encoded.
    pub fn field_writes(&self) -> Result<Vec<FieldWrite>> {
        let mut writes = Vec::new();

        for change in &self.answers {
            let path = match &change.sub_question_label {
                Some(label) => format!("answers.{}.{label}", change.question_id),
                None => format!("answers.{}", change.question_id),
            };
            let value = change.value.clone().map_or(Value::Null, Value::String);
            writes.push(FieldWrite::value(path, value));
        }

        if let Some(nav) = &self.navigation {
            writes.push(FieldWrite::set("current_section_index", nav.section_index)?);
            writes.push(FieldWrite::set("current_question_index", nav.question_index)?);
            writes.push(FieldWrite::set(
                "current_sub_question_label",
                &nav.sub_question_label,
            )?);
        }

        if let Some(sync) = &self.timer {
            writes.push(FieldWrite::set(
                format!("section_time_remaining.{}", sync.section_index),
                sync.remaining_seconds,
            )?);
        }

        Ok(writes)
    }

    /// Apply the final flag states to a flag list as set union / difference.
    #[must_use]
    pub fn merge_flags(&self, current: &[String]) -> Vec<String> {
        let mut merged = current.to_vec();
        for (question_id, flagged) in &self.flags {
            apply_flag(&mut merged, question_id, *flagged);
        }
        merged
    }

    /// Replay annotation edits in order; returns how many were skipped
    /// because their highlight index no longer existed.
    pub fn replay_annotations(&self, maps: &mut AnnotationMaps) -> usize {
        self.annotations
            .iter()
            .filter(|update| !maps.apply(&update.question_id, &update.op))
            .count()
    }

    /// Overlay the plan onto a local copy of the record, mirroring what the
    /// remote will hold once the flush lands.
    pub fn apply_to(&self, record: &mut SessionRecord) {
        for change in &self.answers {
            record.set_answer(
                &change.question_id,
                change.sub_question_label.as_deref(),
                change.value.clone(),
            );
        }

        record.flagged_questions = self.merge_flags(&record.flagged_questions);

        if !self.annotations.is_empty() {
            let mut maps = record.annotation_maps();
            self.replay_annotations(&mut maps);
            record.set_annotation_maps(maps);
        }

        if let Some(nav) = &self.navigation {
            record.current_section_index = nav.section_index;
            record.current_question_index = nav.question_index;
            record.current_sub_question_label.clone_from(&nav.sub_question_label);
        }

        if let Some(sync) = &self.timer {
            record
                .section_time_remaining
                .insert(sync.section_index.to_string(), sync.remaining_seconds);
        }
    }
}
