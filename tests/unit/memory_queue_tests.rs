//! Unit tests for the non-durable queue fallback.

use exam_session_sync::models::queue::{ActionType, AutoSubmit, FlagToggle, QueueAction, QueueItem};
use exam_session_sync::persistence::memory_queue::MemoryQueue;
use exam_session_sync::persistence::queue_store::QueueStore;

fn flag(question_id: &str) -> QueueAction {
    QueueAction::FlagToggle(FlagToggle {
        question_id: question_id.into(),
        flagged: true,
    })
}

#[tokio::test]
async fn lists_by_session_in_insertion_order() {
    let queue = MemoryQueue::new();
    let first = QueueItem::new("s1", flag("q1"));
    let other = QueueItem::new("s2", flag("q9"));
    let second = QueueItem::new("s1", flag("q2"));

    for item in [&first, &other, &second] {
        queue.add(item).await.expect("add");
    }

    let pending = queue.list_pending("s1", None).await.expect("list");
    let ids: Vec<&str> = pending.iter().map(|item| item.id.as_str()).collect();

    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
    assert_eq!(queue.count("s1").await.expect("count"), 2);
    assert!(!queue.is_durable());
}

#[tokio::test]
async fn filter_and_delete() {
    let queue = MemoryQueue::new();
    let toggle = QueueItem::new("s1", flag("q1"));
    let auto = QueueItem::new("s1", QueueAction::AutoSubmit(AutoSubmit { section_index: 1 }));
    queue.add(&toggle).await.expect("add");
    queue.add(&auto).await.expect("add");

    let autos = queue
        .list_pending("s1", Some(ActionType::AutoSubmit))
        .await
        .expect("list");
    assert_eq!(autos, vec![auto.clone()]);

    let removed = queue
        .delete_many(&[toggle.id.clone(), "q:unknown".to_owned()])
        .await
        .expect("delete");
    assert_eq!(removed, 1);
    assert_eq!(queue.count("s1").await.expect("count"), 1);
}

#[tokio::test]
async fn clones_share_items() {
    let queue = MemoryQueue::new();
    let clone = queue.clone();

    clone.add(&QueueItem::new("s1", flag("q1"))).await.expect("add");

    assert_eq!(queue.count("s1").await.expect("count"), 1);
}
