//! Integration tests for claim announcement and sibling invalidation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use exam_session_sync::channel::ChannelHub;
use exam_session_sync::orchestrator::instance_guard::{
    GuardEvent, InstanceGuard, InstanceGuardHandle, OwnershipState,
};
use exam_session_sync::persistence::memory_record::MemoryRecordStore;

use super::test_helpers::{layout, seed_record, LAYOUT, SESSION_ID};

fn guard(
    hub: &ChannelHub,
    remote: &MemoryRecordStore,
    token: &str,
) -> (InstanceGuardHandle, mpsc::Receiver<GuardEvent>) {
    let (tx, rx) = mpsc::channel(8);
    let handle = InstanceGuard::new(
        SESSION_ID.to_owned(),
        Arc::new(hub.channel(SESSION_ID)),
        Arc::new(remote.clone()),
        Arc::new(OwnershipState::with_token(token.to_owned())),
        Duration::from_millis(10),
        Duration::from_millis(500),
        tx,
        CancellationToken::new(),
    )
    .spawn();
    (handle, rx)
}

async fn stored_token(remote: &MemoryRecordStore) -> Option<String> {
    remote
        .snapshot(SESSION_ID)
        .await
        .and_then(|doc| doc.get("ownership_token").and_then(Value::as_str).map(str::to_owned))
}

#[tokio::test]
async fn claim_writes_token_after_settle() {
    let hub = ChannelHub::new();
    let remote = MemoryRecordStore::new();
    seed_record(&remote, &layout(LAYOUT)).await;
    let (guard, mut events) = guard(&hub, &remote, "tokenA");

    guard.claim().await.expect("claim");

    assert_eq!(stored_token(&remote).await.as_deref(), Some("tokenA"));
    assert!(guard.ownership().is_claimed());
    // Our own announcement is not an invalidation.
    assert!(events.try_recv().is_err());
    assert!(!guard.ownership().is_invalidated());
}

#[tokio::test]
async fn sibling_claim_invalidates_earlier_instance() {
    let hub = ChannelHub::new();
    let remote = MemoryRecordStore::new();
    seed_record(&remote, &layout(LAYOUT)).await;
    let (tab_a, mut events_a) = guard(&hub, &remote, "tokenA");
    let (tab_b, mut events_b) = guard(&hub, &remote, "tokenB");

    tab_a.claim().await.expect("claim A");
    // B's listener hears A's announcement too; drain it.
    let _ = tokio::time::timeout(Duration::from_secs(1), events_b.recv()).await;
    tab_b.take_control().await.expect("claim B");

    let event = tokio::time::timeout(Duration::from_secs(2), events_a.recv())
        .await
        .expect("invalidation within 2s")
        .expect("channel open");

    assert_eq!(
        event,
        GuardEvent::Invalidated {
            foreign_token: "tokenB".into()
        }
    );
    assert!(tab_a.ownership().has_yielded());
    assert!(!tab_b.ownership().has_yielded());
    assert_eq!(stored_token(&remote).await.as_deref(), Some("tokenB"));
}

#[tokio::test]
async fn take_control_clears_yield_and_rewrites_token() {
    let hub = ChannelHub::new();
    let remote = MemoryRecordStore::new();
    seed_record(&remote, &layout(LAYOUT)).await;
    let (tab_a, _events_a) = guard(&hub, &remote, "tokenA");
    let (tab_b, mut events_b) = guard(&hub, &remote, "tokenB");

    tab_b.claim().await.expect("claim B");
    tab_a.take_control().await.expect("A takes control");

    assert!(!tab_a.ownership().has_yielded());
    assert!(tab_a.ownership().is_claimed());
    assert_eq!(stored_token(&remote).await.as_deref(), Some("tokenA"));

    let event = tokio::time::timeout(Duration::from_secs(2), events_b.recv())
        .await
        .expect("B invalidated within 2s")
        .expect("channel open");
    assert!(matches!(event, GuardEvent::Invalidated { ref foreign_token } if foreign_token == "tokenA"));
}

#[tokio::test]
async fn failed_token_write_leaves_instance_unclaimed() {
    let hub = ChannelHub::new();
    let remote = MemoryRecordStore::new();
    let (tab, _events) = guard(&hub, &remote, "tokenA");

    // No record exists yet, so the update fails.
    assert!(tab.claim().await.is_err());
    assert!(!tab.ownership().is_claimed());

    tab.await_completion().await;
}
