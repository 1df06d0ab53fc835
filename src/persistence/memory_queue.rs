//! In-memory queue used when the durable store cannot be opened.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::models::queue::{ActionType, QueueItem};

use super::queue_store::{QueueStore, StoreFuture};

/// Non-durable [`QueueStore`]; contents die with the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    items: Arc<Mutex<Vec<QueueItem>>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueue {
    fn add(&self, item: &QueueItem) -> StoreFuture<'_, String> {
        let item = item.clone();
        Box::pin(async move {
            let id = item.id.clone();
            self.items.lock().await.push(item);
            Ok(id)
        })
    }

    fn list_pending(
        &self,
        session_id: &str,
        filter: Option<ActionType>,
    ) -> StoreFuture<'_, Vec<QueueItem>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let items = self.items.lock().await;
            Ok(items
                .iter()
                .filter(|item| item.session_id == session_id)
                .filter(|item| filter.map_or(true, |t| item.action_type() == t))
                .cloned()
                .collect())
        })
    }

    fn delete_many(&self, ids: &[String]) -> StoreFuture<'_, u64> {
        let ids = ids.to_vec();
        Box::pin(async move {
            let mut items = self.items.lock().await;
            let before = items.len();
            items.retain(|item| !ids.contains(&item.id));
            Ok(u64::try_from(before - items.len()).unwrap_or(u64::MAX))
        })
    }

    fn count(&self, session_id: &str) -> StoreFuture<'_, u64> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let items = self.items.lock().await;
            let count = items
                .iter()
                .filter(|item| item.session_id == session_id)
                .count();
            Ok(u64::try_from(count).unwrap_or(u64::MAX))
        })
    }

    fn is_durable(&self) -> bool {
        false
    }
}
