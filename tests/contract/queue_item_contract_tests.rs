//! Contract tests for the persisted queue item and claim message shapes.
//!
//! Queue items outlive the process that wrote them, so their JSON shape is
//! a compatibility surface between releases.

use chrono::{TimeZone, Utc};
use serde_json::json;

use exam_session_sync::channel::ClaimMessage;
use exam_session_sync::models::annotation::{AnnotationOp, Highlight};
use exam_session_sync::models::queue::{
    ActionType, AnnotationUpdate, AnswerChange, AutoSubmit, QueueAction, QueueItem,
};

#[test]
fn answer_change_item_shape() {
    let mut item = QueueItem::at(
        "u1_t1",
        QueueAction::AnswerChange(AnswerChange {
            question_id: "q2".into(),
            sub_question_label: Some("a".into()),
            value: None,
        }),
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap(),
    );
    item.id = "q:fixed".into();

    let value = serde_json::to_value(&item).expect("serialize");

    assert_eq!(
        value,
        json!({
            "id": "q:fixed",
            "session_id": "u1_t1",
            "local_timestamp": "2026-03-01T09:30:00Z",
            "action": {
                "action_type": "ANSWER_CHANGE",
                "payload": {
                    "question_id": "q2",
                    "sub_question_label": "a",
                    "value": null
                }
            },
            "status": "PENDING"
        })
    );
}

#[test]
fn annotation_op_is_tagged_by_op() {
    let action = QueueAction::AnnotationUpdate(AnnotationUpdate {
        question_id: "q1".into(),
        op: AnnotationOp::AddHighlight {
            highlight: Highlight {
                start: 3,
                end: 9,
                color: "green".into(),
            },
        },
    });

    assert_eq!(
        serde_json::to_value(&action).expect("serialize"),
        json!({
            "action_type": "ANNOTATION_UPDATE",
            "payload": {
                "question_id": "q1",
                "op": {
                    "op": "ADD_HIGHLIGHT",
                    "highlight": { "start": 3, "end": 9, "color": "green" }
                }
            }
        })
    );
    assert_eq!(
        serde_json::to_value(AnnotationOp::ClearAll).expect("serialize"),
        json!({ "op": "CLEAR_ALL" })
    );
}

#[test]
fn auto_submit_parses_from_stored_json() {
    let action: QueueAction = serde_json::from_value(json!({
        "action_type": "AUTO_SUBMIT",
        "payload": { "section_index": 2 }
    }))
    .expect("deserialize");

    assert_eq!(action, QueueAction::AutoSubmit(AutoSubmit { section_index: 2 }));
    assert_eq!(action.action_type(), ActionType::AutoSubmit);
}

#[test]
fn action_type_strings_round_trip() {
    for action_type in [
        ActionType::AnswerChange,
        ActionType::FlagToggle,
        ActionType::Navigation,
        ActionType::TimerSync,
        ActionType::AnnotationUpdate,
        ActionType::AutoSubmit,
    ] {
        let stored = action_type.as_str();
        assert_eq!(ActionType::parse(stored).expect("known type"), action_type);
        assert_eq!(
            serde_json::to_value(action_type).expect("serialize"),
            json!(stored)
        );
    }
    assert!(ActionType::parse("SUBMIT").is_err());
}

#[test]
fn claim_message_shape() {
    let message = ClaimMessage::SessionClaimed {
        token: "tokenA".into(),
    };

    assert_eq!(
        serde_json::to_value(&message).expect("serialize"),
        json!({ "type": "SESSION_CLAIMED", "token": "tokenA" })
    );
}
