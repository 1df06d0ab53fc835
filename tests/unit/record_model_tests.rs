//! Unit tests for the session record and annotation models.

use std::collections::BTreeMap;

use exam_session_sync::models::annotation::{AnnotationMaps, AnnotationOp, Highlight};
use exam_session_sync::models::layout::TestLayout;
use exam_session_sync::models::record::{session_id_for, Answer, SessionRecord, SessionStatus};

fn layout() -> TestLayout {
    TestLayout::from_toml_str(
        r#"
test_id = "t1"

[[sections]]
name = "A"
time_limit_seconds = 90
questions = [{ id = "q1" }, { id = "q2", sub_questions = ["a", "b"] }]

[[sections]]
name = "B"
time_limit_seconds = 30
questions = [{ id = "q3" }]
"#,
    )
    .expect("valid layout")
}

fn highlight(start: usize) -> Highlight {
    Highlight {
        start,
        end: start + 3,
        color: "yellow".into(),
    }
}

#[test]
fn new_record_seeds_section_time() {
    let record = SessionRecord::new("u1", "t1", &layout());

    assert_eq!(record.id, session_id_for("u1", "t1"));
    assert_eq!(record.id, "u1_t1");
    assert_eq!(record.status, SessionStatus::NotStarted);
    assert_eq!(record.time_remaining(0), Some(90));
    assert_eq!(record.time_remaining(1), Some(30));
    assert_eq!(record.time_remaining(2), None);
}

#[test]
fn labelled_answer_replaces_single_value() {
    let mut record = SessionRecord::new("u1", "t1", &layout());

    record.set_answer("q2", None, Some("whole".into()));
    record.set_answer("q2", Some("a"), Some("1".into()));

    assert_eq!(
        record.answers.get("q2"),
        Some(&Answer::Parts(BTreeMap::from([(
            "a".to_owned(),
            Some("1".to_owned())
        )])))
    );
    assert_eq!(record.answer_for("q2", Some("a")), Some("1"));
    assert_eq!(record.answer_for("q2", None), None);
}

#[test]
fn cleared_answer_reads_as_none() {
    let mut record = SessionRecord::new("u1", "t1", &layout());

    record.set_answer("q1", None, Some("B".into()));
    record.set_answer("q1", None, None);

    assert_eq!(record.answers.get("q1"), Some(&Answer::Single(None)));
    assert_eq!(record.answer_for("q1", None), None);
}

#[test]
fn flags_never_duplicate() {
    let mut record = SessionRecord::new("u1", "t1", &layout());

    record.set_flag("q1", true);
    record.set_flag("q1", true);
    record.set_flag("q3", true);
    record.set_flag("q1", false);

    assert_eq!(record.flagged_questions, vec!["q3".to_owned()]);
    assert!(!record.is_flagged("q1"));
}

#[test]
fn status_transitions() {
    let mut record = SessionRecord::new("u1", "t1", &layout());

    assert!(record.can_transition_to(SessionStatus::InProgress));
    assert!(!record.can_transition_to(SessionStatus::Completed));

    record.status = SessionStatus::InProgress;
    assert!(record.can_transition_to(SessionStatus::Completed));
    assert!(record.can_transition_to(SessionStatus::Paused));

    record.status = SessionStatus::Completed;
    assert!(record.is_completed());
    assert!(!record.can_transition_to(SessionStatus::InProgress));
}

#[test]
fn record_decodes_with_missing_optional_fields() {
    let record: SessionRecord = serde_json::from_value(serde_json::json!({
        "id": "u1_t1",
        "user_id": "u1",
        "test_id": "t1",
        "status": "IN_PROGRESS",
        "answers": { "q1": "B", "q2": { "a": "1", "b": null } }
    }))
    .expect("record decodes");

    assert_eq!(record.answer_for("q1", None), Some("B"));
    assert_eq!(record.answer_for("q2", Some("a")), Some("1"));
    assert_eq!(record.answer_for("q2", Some("b")), None);
    assert!(record.flagged_questions.is_empty());
    assert!(record.ownership_token.is_none());
}

#[test]
fn stale_highlight_index_is_skipped() {
    let mut maps = AnnotationMaps::default();

    assert!(maps.apply("q1", &AnnotationOp::AddHighlight { highlight: highlight(0) }));
    assert!(!maps.apply("q1", &AnnotationOp::RemoveHighlight { index: 3 }));
    assert_eq!(maps.annotations.get("q1").map(Vec::len), Some(1));

    assert!(maps.apply("q1", &AnnotationOp::RemoveHighlight { index: 0 }));
    assert!(maps.annotations.get("q1").is_none());
}

#[test]
fn strikethrough_toggles() {
    let mut maps = AnnotationMaps::default();
    let strike = AnnotationOp::ToggleStrikethrough {
        choice: "C".into(),
    };

    maps.apply("q1", &strike);
    assert_eq!(maps.strikethroughs.get("q1"), Some(&vec!["C".to_owned()]));

    maps.apply("q1", &strike);
    assert!(maps.strikethroughs.get("q1").is_none());
}

#[test]
fn clear_all_is_scoped_to_one_question() {
    let mut maps = AnnotationMaps::default();
    maps.apply("q1", &AnnotationOp::AddHighlight { highlight: highlight(0) });
    maps.apply("q1", &AnnotationOp::ToggleStrikethrough { choice: "A".into() });
    maps.apply("q2", &AnnotationOp::AddHighlight { highlight: highlight(5) });

    maps.apply("q1", &AnnotationOp::ClearAll);

    assert!(maps.annotations.get("q1").is_none());
    assert!(maps.strikethroughs.get("q1").is_none());
    assert_eq!(maps.annotations.get("q2").map(Vec::len), Some(1));
}
