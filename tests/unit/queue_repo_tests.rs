//! Unit tests for the durable `SQLite` queue repository.

use std::sync::Arc;

use chrono::{Duration, Utc};
use exam_session_sync::models::annotation::AnnotationOp;
use exam_session_sync::models::queue::{
    ActionType, AnnotationUpdate, AnswerChange, AutoSubmit, QueueAction, QueueItem, TimerSync,
};
use exam_session_sync::persistence::db;
use exam_session_sync::persistence::queue_repo::QueueRepo;
use exam_session_sync::persistence::queue_store::QueueStore;

async fn repo() -> QueueRepo {
    let pool = db::connect_memory().await.expect("in-memory db");
    QueueRepo::new(Arc::new(pool))
}

fn answer(question_id: &str, value: &str) -> QueueAction {
    QueueAction::AnswerChange(AnswerChange {
        question_id: question_id.into(),
        sub_question_label: None,
        value: Some(value.into()),
    })
}

#[tokio::test]
async fn items_round_trip_in_insertion_order() {
    let repo = repo().await;
    let t0 = Utc::now();
    // Later insertion with an earlier timestamp still lists second.
    let first = QueueItem::at("s1", answer("q1", "B"), t0);
    let second = QueueItem::at(
        "s1",
        QueueAction::AnnotationUpdate(AnnotationUpdate {
            question_id: "q1".into(),
            op: AnnotationOp::ClearAll,
        }),
        t0 - Duration::seconds(30),
    );

    assert_eq!(repo.add(&first).await.expect("add"), first.id);
    repo.add(&second).await.expect("add");

    let pending = repo.list_pending("s1", None).await.expect("list");
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first.id);
    assert_eq!(pending[0].action, first.action);
    assert_eq!(pending[1].id, second.id);
    assert_eq!(pending[1].action, second.action);
    assert!(repo.is_durable());
}

#[tokio::test]
async fn filter_by_action_type() {
    let repo = repo().await;
    repo.add(&QueueItem::new("s1", answer("q1", "A")))
        .await
        .expect("add");
    let auto = QueueItem::new("s1", QueueAction::AutoSubmit(AutoSubmit { section_index: 0 }));
    repo.add(&auto).await.expect("add");
    repo.add(&QueueItem::new(
        "s1",
        QueueAction::TimerSync(TimerSync {
            section_index: 0,
            remaining_seconds: 12,
        }),
    ))
    .await
    .expect("add");

    let autos = repo
        .list_pending("s1", Some(ActionType::AutoSubmit))
        .await
        .expect("list");

    assert_eq!(autos.len(), 1);
    assert_eq!(autos[0].id, auto.id);
}

#[tokio::test]
async fn delete_many_is_scoped_to_ids() {
    let repo = repo().await;
    let keep = QueueItem::new("s1", answer("q1", "A"));
    let drop_a = QueueItem::new("s1", answer("q2", "B"));
    let drop_b = QueueItem::new("s2", answer("q3", "C"));
    for item in [&keep, &drop_a, &drop_b] {
        repo.add(item).await.expect("add");
    }

    let removed = repo
        .delete_many(&[drop_a.id.clone(), drop_b.id.clone()])
        .await
        .expect("delete");

    assert_eq!(removed, 2);
    assert_eq!(repo.count("s1").await.expect("count"), 1);
    assert_eq!(repo.count("s2").await.expect("count"), 0);
}

#[tokio::test]
async fn empty_delete_is_noop() {
    let repo = repo().await;
    repo.add(&QueueItem::new("s1", answer("q1", "A")))
        .await
        .expect("add");

    assert_eq!(repo.delete_many(&[]).await.expect("delete"), 0);
    assert_eq!(repo.count("s1").await.expect("count"), 1);
}
