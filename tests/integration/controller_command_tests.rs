//! Integration tests for student commands on an open session.

use std::time::Duration;

use exam_session_sync::models::annotation::{AnnotationOp, Highlight};
use exam_session_sync::models::queue::ActionType;
use exam_session_sync::sync::flush::FlushOutcome;
use exam_session_sync::AppError;

use super::test_helpers::{
    fast_config, wait_for_queue_len, wait_for_record, wait_for_view, Harness, LAYOUT,
};

/// Harness whose debounce never elapses during a test.
fn quiet() -> Harness {
    let mut config = fast_config();
    config.sync.debounce_ms = 60_000;
    Harness::with(config, LAYOUT)
}

#[tokio::test]
async fn answer_is_local_first_then_flushed() {
    let harness = Harness::new();
    let controller = harness.open("tokenA").await.expect("open");

    controller.set_answer(Some("B".into())).await.expect("answer");

    assert_eq!(controller.view().current_answer.as_deref(), Some("B"));
    wait_for_record(&harness.remote, "answer flushed", |record| {
        record.answer_for("q1", None) == Some("B")
    })
    .await;
    wait_for_queue_len(harness.queue.as_ref(), 0).await;

    controller.set_answer(None).await.expect("clear");
    assert_eq!(controller.view().current_answer, None);
}

#[tokio::test]
async fn toggle_flag_alternates() {
    let harness = quiet();
    let controller = harness.open("tokenA").await.expect("open");

    assert!(controller.toggle_flag().await.expect("flag"));
    assert_eq!(controller.view().flags, vec!["q1".to_owned()]);
    assert!(!controller.toggle_flag().await.expect("unflag"));
    assert!(controller.view().flags.is_empty());

    let toggles = harness.pending(Some(ActionType::FlagToggle)).await;
    assert_eq!(toggles.len(), 2);
}

#[tokio::test]
async fn navigation_stays_within_section() {
    let harness = quiet();
    let controller = harness.open("tokenA").await.expect("open");

    let position = controller.go_previous().await.expect("prev");
    assert_eq!(position.question_index, 0);

    let position = controller.go_next().await.expect("next");
    assert_eq!(position.question_index, 1);
    assert_eq!(position.sub_question_label.as_deref(), Some("a"));

    controller.go_next().await.expect("next");
    let position = controller.go_next().await.expect("next at end");
    assert_eq!(position.section_index, 0);
    assert_eq!(position.question_index, 2);
    assert_eq!(controller.view().question_id.as_deref(), Some("q5"));
}

#[tokio::test]
async fn sub_question_answers_are_separate() {
    let harness = quiet();
    let controller = harness.open("tokenA").await.expect("open");

    let err = controller
        .select_sub_question("a")
        .await
        .expect_err("q1 has no parts");
    assert!(matches!(err, AppError::NotFound(_)));

    controller.go_next().await.expect("next");
    controller.set_answer(Some("1".into())).await.expect("answer a");
    controller.select_sub_question("b").await.expect("select b");
    controller.set_answer(Some("2".into())).await.expect("answer b");

    assert_eq!(controller.view().current_answer.as_deref(), Some("2"));
    let record = controller.record();
    assert_eq!(record.answer_for("q2", Some("a")), Some("1"));
    assert_eq!(record.answer_for("q2", Some("b")), Some("2"));

    assert!(matches!(
        controller.select_sub_question("z").await,
        Err(AppError::NotFound(_))
    ));

    controller.flush_now().await.expect("flush");
    let remote = harness.remote_record().await;
    assert_eq!(remote.answer_for("q2", Some("b")), Some("2"));
    assert_eq!(remote.current_sub_question_label.as_deref(), Some("b"));
}

#[tokio::test]
async fn annotations_apply_to_current_question() {
    let harness = quiet();
    let controller = harness.open("tokenA").await.expect("open");

    controller
        .annotate(AnnotationOp::AddHighlight {
            highlight: Highlight {
                start: 0,
                end: 4,
                color: "yellow".into(),
            },
        })
        .await
        .expect("highlight");
    controller
        .annotate(AnnotationOp::ToggleStrikethrough { choice: "A".into() })
        .await
        .expect("strike");

    let record = controller.record();
    assert_eq!(record.annotations.get("q1").map(Vec::len), Some(1));
    assert_eq!(record.strikethroughs.get("q1"), Some(&vec!["A".to_owned()]));

    controller
        .annotate(AnnotationOp::ClearAll)
        .await
        .expect("clear");
    assert_eq!(
        controller.flush_now().await.expect("flush"),
        FlushOutcome::Flushed { consumed: 3 }
    );
    let remote = harness.remote_record().await;
    assert!(remote.annotations.is_empty());
    assert!(remote.strikethroughs.is_empty());
}

#[tokio::test]
async fn hidden_page_flushes_without_debounce() {
    let harness = quiet();
    let controller = harness.open("tokenA").await.expect("open");
    controller.set_answer(Some("B".into())).await.expect("answer");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.pending(None).await.len(), 1);

    controller.notify_hidden();

    wait_for_queue_len(harness.queue.as_ref(), 0).await;
}

#[tokio::test]
async fn close_checkpoints_timer_and_flushes() {
    let harness = quiet();
    let controller = harness.open("tokenA").await.expect("open");
    controller.set_answer(Some("B".into())).await.expect("answer");

    controller.close().await;

    let record = harness.remote_record().await;
    assert_eq!(record.answer_for("q1", None), Some("B"));
    assert_eq!(record.time_remaining(0), Some(600));
    assert!(harness.pending(None).await.is_empty());
}

#[tokio::test]
async fn countdown_publishes_and_checkpoints() {
    let mut config = fast_config();
    config.timer.tick_ms = 10;
    config.timer.sync_interval_seconds = 3;
    let harness = Harness::with(config, LAYOUT);
    let controller = harness.open("tokenA").await.expect("open");

    wait_for_view(&controller, "countdown", |view| view.time_remaining < 600).await;
    let record = wait_for_record(&harness.remote, "timer checkpoint", |record| {
        record.time_remaining(0).is_some_and(|seconds| seconds < 600)
    })
    .await;

    assert!(record.time_remaining(0).is_some_and(|seconds| seconds <= 597));
}

#[tokio::test]
async fn visible_page_beats_immediately() {
    let harness = quiet();
    let controller = harness.open("tokenA").await.expect("open");
    let first = wait_for_record(&harness.remote, "opening heartbeat", |record| {
        record.last_heartbeat.is_some()
    })
    .await
    .last_heartbeat;
    tokio::time::sleep(Duration::from_millis(5)).await;

    controller.notify_visible();

    wait_for_record(&harness.remote, "second heartbeat", |record| {
        record.last_heartbeat > first
    })
    .await;
}
