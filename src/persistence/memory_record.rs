//! In-process remote record store with fault injection.
//!
//! Clones share the same documents, so several controllers built from one
//! store behave like duplicate tabs talking to one backend. The fault plan
//! simulates outages, flaky calls and slow responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::{AppError, Result};

use super::record_store::{apply_writes, FieldWrite, RecordStore, StoreFuture, TransactFn};

#[derive(Debug, Default)]
struct FaultPlan {
    offline: AtomicBool,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
}

/// Shared in-memory [`RecordStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    docs: Arc<Mutex<HashMap<String, Value>>>,
    faults: Arc<FaultPlan>,
    mutations: Arc<AtomicU64>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every call with a connectivity error while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with a connectivity error.
    pub fn fail_next(&self, count: u32) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.faults.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of committed mutating calls (`update`, `transact`, creations).
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Read a document bypassing the fault plan.
    pub async fn snapshot(&self, id: &str) -> Option<Value> {
        self.docs.lock().await.get(id).cloned()
    }

    async fn gate(&self) -> Result<()> {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(AppError::Connectivity("remote store unreachable".into()));
        }
        let injected = self
            .faults
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AppError::Connectivity("injected remote failure".into()));
        }
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, id: &str) -> StoreFuture<'_, Option<Value>> {
        let id = id.to_owned();
        Box::pin(async move {
            self.gate().await?;
            Ok(self.docs.lock().await.get(&id).cloned())
        })
    }

    fn create_if_absent(&self, id: &str, writes: Vec<FieldWrite>) -> StoreFuture<'_, bool> {
        let id = id.to_owned();
        Box::pin(async move {
            self.gate().await?;
            let mut docs = self.docs.lock().await;
            if docs.contains_key(&id) {
                return Ok(false);
            }
            let mut doc = Value::Object(Map::new());
            apply_writes(&mut doc, &writes, Utc::now())?;
            docs.insert(id, doc);
            self.mutations.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
    }

    fn update(&self, id: &str, writes: Vec<FieldWrite>) -> StoreFuture<'_, ()> {
        let id = id.to_owned();
        Box::pin(async move {
            self.gate().await?;
            let mut docs = self.docs.lock().await;
            let doc = docs
                .get_mut(&id)
                .ok_or_else(|| AppError::NotFound(format!("record {id} not found")))?;
            let mut next = doc.clone();
            apply_writes(&mut next, &writes, Utc::now())?;
            *doc = next;
            self.mutations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn transact(&self, id: &str, body: TransactFn) -> StoreFuture<'_, ()> {
        let id = id.to_owned();
        Box::pin(async move {
            self.gate().await?;
            let mut docs = self.docs.lock().await;
            let current = docs.get(&id);
            let writes = body(current)?;
            if writes.is_empty() {
                return Ok(());
            }
            let mut next = current
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            apply_writes(&mut next, &writes, Utc::now())?;
            docs.insert(id, next);
            self.mutations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
