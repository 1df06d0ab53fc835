//! Action queue store contract and opening with degraded fallback.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{info, warn};

use crate::models::queue::{ActionType, QueueItem};
use crate::Result;

use super::db;
use super::memory_queue::MemoryQueue;
use super::queue_repo::QueueRepo;

/// Boxed future returned by store trait methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Process-local keyed storage for pending mutations.
///
/// Implementations report failures as
/// [`AppError::StoreUnavailable`](crate::AppError::StoreUnavailable); callers
/// log and continue rather than surfacing them to the student.
pub trait QueueStore: Send + Sync {
    /// Persist a pending item and return its id.
    fn add(&self, item: &QueueItem) -> StoreFuture<'_, String>;

    /// Pending items for a session in insertion order, optionally of one type.
    fn list_pending(
        &self,
        session_id: &str,
        filter: Option<ActionType>,
    ) -> StoreFuture<'_, Vec<QueueItem>>;

    /// Delete items atomically; returns how many existed.
    fn delete_many(&self, ids: &[String]) -> StoreFuture<'_, u64>;

    /// Number of pending items for a session.
    fn count(&self, session_id: &str) -> StoreFuture<'_, u64>;

    /// Whether items survive a process restart.
    fn is_durable(&self) -> bool;
}

/// Open the durable `SQLite` queue, or fall back to an in-memory queue.
///
/// The fallback keeps the session usable when local storage is restricted
/// but loses the offline guarantee; the condition is logged and visible
/// through [`QueueStore::is_durable`].
pub async fn open_queue_store(path: &Path) -> Arc<dyn QueueStore> {
    match db::connect(path).await {
        Ok(pool) => {
            info!(path = %path.display(), "durable queue store opened");
            Arc::new(QueueRepo::new(Arc::new(pool)))
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                %err,
                "queue store unavailable; continuing without offline durability"
            );
            Arc::new(MemoryQueue::new())
        }
    }
}
