//! Integration tests for flush triggers, debounce and retry backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use exam_session_sync::config::{SyncConfig, TimeoutConfig};
use exam_session_sync::connectivity::Connectivity;
use exam_session_sync::models::queue::{AnswerChange, QueueAction, QueueItem};
use exam_session_sync::persistence::memory_queue::MemoryQueue;
use exam_session_sync::persistence::memory_record::MemoryRecordStore;
use exam_session_sync::persistence::queue_store::QueueStore;
use exam_session_sync::sync::flush::{FlushEngine, FlushScheduler, FlushSchedulerHandle, FlushTrigger};

use super::test_helpers::{
    layout, remote_record, seed_record, wait_for_queue_len, LAYOUT, SESSION_ID,
};

fn sync_config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 30,
        max_flush_attempts: 3,
        backoff_base_ms: 20,
        max_backoff_ms: 40,
    }
}

struct Fixture {
    queue: Arc<MemoryQueue>,
    remote: MemoryRecordStore,
    connectivity: Connectivity,
    scheduler: FlushSchedulerHandle,
}

async fn fixture(online: bool) -> Fixture {
    let fx = unseeded(online, &sync_config());
    seed_record(&fx.remote, &layout(LAYOUT)).await;
    fx
}

fn unseeded(online: bool, config: &SyncConfig) -> Fixture {
    let queue = Arc::new(MemoryQueue::new());
    let remote = MemoryRecordStore::new();
    let connectivity = Connectivity::new(online);

    let engine = Arc::new(FlushEngine::new(
        SESSION_ID.to_owned(),
        Arc::clone(&queue) as Arc<dyn QueueStore>,
        Arc::new(remote.clone()),
        TimeoutConfig::default(),
    ));
    let scheduler = FlushScheduler::new(
        engine,
        config,
        connectivity.subscribe(),
        CancellationToken::new(),
    )
    .spawn();

    Fixture {
        queue,
        remote,
        connectivity,
        scheduler,
    }
}

async fn enqueue_answer(queue: &MemoryQueue, value: &str) {
    queue
        .add(&QueueItem::new(
            SESSION_ID,
            QueueAction::AnswerChange(AnswerChange {
                question_id: "q1".into(),
                sub_question_label: None,
                value: Some(value.into()),
            }),
        ))
        .await
        .expect("queue add");
}

#[tokio::test]
async fn queued_items_flush_after_debounce() {
    let fx = fixture(true).await;
    enqueue_answer(&fx.queue, "A").await;
    fx.scheduler.trigger(FlushTrigger::ItemQueued);
    enqueue_answer(&fx.queue, "B").await;
    fx.scheduler.trigger(FlushTrigger::ItemQueued);

    wait_for_queue_len(fx.queue.as_ref(), 0).await;

    assert_eq!(remote_record(&fx.remote).await.answer_for("q1", None), Some("B"));
    fx.scheduler.await_completion().await;
}

#[tokio::test]
async fn failed_flush_retries_with_backoff() {
    let fx = fixture(true).await;
    enqueue_answer(&fx.queue, "A").await;
    fx.remote.fail_next(2);

    fx.scheduler.trigger(FlushTrigger::Now);

    wait_for_queue_len(fx.queue.as_ref(), 0).await;
    assert_eq!(remote_record(&fx.remote).await.answer_for("q1", None), Some("A"));
}

#[tokio::test]
async fn exhausted_retries_wait_for_next_trigger() {
    let fx = fixture(true).await;
    enqueue_answer(&fx.queue, "A").await;
    fx.remote.fail_next(100);

    fx.scheduler.trigger(FlushTrigger::Now);
    // Three attempts with 20ms and 40ms pauses between them.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.queue.count(SESSION_ID).await.expect("count"), 1);

    fx.remote.fail_next(0);
    fx.scheduler.trigger(FlushTrigger::Now);

    wait_for_queue_len(fx.queue.as_ref(), 0).await;
}

#[tokio::test]
async fn offline_defers_until_connectivity_returns() {
    let fx = fixture(false).await;
    enqueue_answer(&fx.queue, "A").await;

    fx.scheduler.trigger(FlushTrigger::Now);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.queue.count(SESSION_ID).await.expect("count"), 1);

    fx.connectivity.set_online(true);

    wait_for_queue_len(fx.queue.as_ref(), 0).await;
    assert_eq!(remote_record(&fx.remote).await.answer_for("q1", None), Some("A"));
}

#[tokio::test]
async fn missing_record_is_not_retried() {
    let fx = unseeded(
        true,
        &SyncConfig {
            debounce_ms: 30,
            max_flush_attempts: 5,
            backoff_base_ms: 300,
            max_backoff_ms: 1200,
        },
    );
    enqueue_answer(&fx.queue, "A").await;

    fx.scheduler.trigger(FlushTrigger::Now);
    tokio::time::sleep(Duration::from_millis(100)).await;
    seed_record(&fx.remote, &layout(LAYOUT)).await;

    // A retry would have landed 300ms after the failed attempt.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(fx.queue.count(SESSION_ID).await.expect("count"), 1);

    fx.scheduler.trigger(FlushTrigger::Now);
    wait_for_queue_len(fx.queue.as_ref(), 0).await;
    assert_eq!(remote_record(&fx.remote).await.answer_for("q1", None), Some("A"));
}
