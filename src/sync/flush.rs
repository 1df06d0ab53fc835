//! Queue flush engine and its debounced, backed-off scheduler.
//!
//! [`FlushEngine::flush`] drains one batch: plan, write, delete. It is
//! non-reentrant; a request made while a flush runs returns
//! [`FlushOutcome::Skipped`]. [`FlushScheduler`] owns the natural triggers
//! (item queued, connectivity restored, explicit request) and the retry
//! policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{SyncConfig, TimeoutConfig};
use crate::models::annotation::AnnotationMaps;
use crate::models::queue::{ActionType, QueueItem};
use crate::persistence::queue_store::QueueStore;
use crate::persistence::record_store::{with_budget, FieldWrite, RecordStore};
use crate::{AppError, Result};

use super::merge::{self, FlushPlan};

/// Result of one flush request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush was already running; nothing was done.
    Skipped,
    /// No mergeable items were pending.
    Empty,
    /// Items were written and deleted from the queue.
    Flushed {
        /// Number of queue items consumed.
        consumed: usize,
    },
}

/// Exponential backoff between failed flush attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Total attempts, first try included.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }
}

impl From<&SyncConfig> for BackoffPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            max_attempts: config.max_flush_attempts,
        }
    }
}

/// Drains one session's queue into its remote record.
pub struct FlushEngine {
    session_id: String,
    queue: Arc<dyn QueueStore>,
    remote: Arc<dyn RecordStore>,
    timeouts: TimeoutConfig,
    flushing: AtomicBool,
    syncing: watch::Sender<bool>,
}

/// Clears the in-progress flag however the flush exits.
struct FlushGuard<'a> {
    engine: &'a FlushEngine,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.engine.flushing.store(false, Ordering::SeqCst);
        self.engine.syncing.send_replace(false);
    }
}

impl FlushEngine {
    /// Create an engine for one session.
    #[must_use]
    pub fn new(
        session_id: String,
        queue: Arc<dyn QueueStore>,
        remote: Arc<dyn RecordStore>,
        timeouts: TimeoutConfig,
    ) -> Self {
        let (syncing, _rx) = watch::channel(false);
        Self {
            session_id,
            queue,
            remote,
            timeouts,
            flushing: AtomicBool::new(false),
            syncing,
        }
    }

    /// Whether a flush is currently running.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Receiver tracking the in-progress state, for the UI's syncing indicator.
    #[must_use]
    pub fn subscribe_syncing(&self) -> watch::Receiver<bool> {
        self.syncing.subscribe()
    }

    /// Wait until no flush is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.syncing.subscribe();
        // Sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|syncing| !*syncing).await;
    }

    /// Drain pending items into the remote record.
    ///
    /// A failure or timeout leaves items pending for the next attempt.
    /// Annotation edits are deleted as soon as their transaction commits;
    /// the remaining items once every write for the batch succeeded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StoreUnavailable` if the queue cannot be read, or
    /// the remote error (`Connectivity`, `Timeout`, `NotFound`, …) of the
    /// first failed write.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        if self.flushing.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.session_id, "flush already running; request suppressed");
            return Ok(FlushOutcome::Skipped);
        }
        self.syncing.send_replace(true);
        let _guard = FlushGuard { engine: self };

        let items: Vec<QueueItem> = self
            .queue
            .list_pending(&self.session_id, None)
            .await?
            .into_iter()
            .filter(|item| item.action_type() != ActionType::AutoSubmit)
            .collect();

        let plan = merge::plan(&items);
        if plan.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        self.write_plan(&plan).await?;

        if !plan.annotations.is_empty() {
            self.replay_annotations(&plan).await?;
            // Replaying an edit twice would duplicate it. A failure here is
            // the one window in which that can still happen.
            self.delete_consumed(&plan.annotation_ids).await;
        }

        // Answers, flags, position and timer writes are idempotent; if this
        // delete fails they are merged again next time.
        let idempotent: Vec<String> = plan
            .consumed_ids
            .iter()
            .filter(|id| !plan.annotation_ids.contains(id))
            .cloned()
            .collect();
        self.delete_consumed(&idempotent).await;

        let consumed = plan.consumed_ids.len();
        info!(session_id = %self.session_id, consumed, "queue flushed");
        Ok(FlushOutcome::Flushed { consumed })
    }

    async fn write_plan(&self, plan: &FlushPlan) -> Result<()> {
        let write_budget = self.timeouts.write();

        let mut writes = plan.field_writes()?;
        if !writes.is_empty() {
            writes.push(FieldWrite::server_timestamp("last_action"));
            with_budget(
                write_budget,
                "flush field update",
                self.remote.update(&self.session_id, writes),
            )
            .await?;
        }

        if !plan.flags.is_empty() {
            let flag_plan = plan.clone();
            with_budget(
                write_budget,
                "flag merge",
                self.remote.transact(
                    &self.session_id,
                    Box::new(move |doc: Option<&Value>| merge_flags_body(doc, &flag_plan)),
                ),
            )
            .await?;
        }

        Ok(())
    }

    async fn replay_annotations(&self, plan: &FlushPlan) -> Result<()> {
        let annotation_plan = plan.clone();
        let session_id = self.session_id.clone();
        with_budget(
            self.timeouts.write(),
            "annotation replay",
            self.remote.transact(
                &self.session_id,
                Box::new(move |doc: Option<&Value>| {
                    replay_annotations_body(doc, &annotation_plan, &session_id)
                }),
            ),
        )
        .await
    }

    async fn delete_consumed(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        match self.queue.delete_many(ids).await {
            Ok(removed) => {
                debug!(session_id = %self.session_id, removed, "flushed items deleted");
            }
            Err(err) => {
                warn!(session_id = %self.session_id, %err, "failed to delete flushed items");
            }
        }
    }
}

fn require_doc(doc: Option<&Value>) -> Result<&Value> {
    doc.ok_or_else(|| AppError::NotFound("session record missing during merge".into()))
}

fn field_or_default<T: DeserializeOwned + Default>(doc: &Value, field: &str) -> Result<T> {
    match doc.get(field) {
        Some(value) if !value.is_null() => Ok(serde_json::from_value(value.clone())?),
        _ => Ok(T::default()),
    }
}

fn merge_flags_body(doc: Option<&Value>, plan: &FlushPlan) -> Result<Vec<FieldWrite>> {
    let doc = require_doc(doc)?;
    let current: Vec<String> = field_or_default(doc, "flagged_questions")?;
    Ok(vec![
        FieldWrite::set("flagged_questions", plan.merge_flags(&current))?,
        FieldWrite::server_timestamp("last_action"),
    ])
}

fn replay_annotations_body(
    doc: Option<&Value>,
    plan: &FlushPlan,
    session_id: &str,
) -> Result<Vec<FieldWrite>> {
    let doc = require_doc(doc)?;
    // Decoding produces an owned deep copy; the stored maps are only
    // replaced if the whole replay succeeds.
    let mut maps = AnnotationMaps {
        annotations: field_or_default(doc, "annotations")?,
        strikethroughs: field_or_default(doc, "strikethroughs")?,
    };

    let skipped = plan.replay_annotations(&mut maps);
    if skipped > 0 {
        warn!(%session_id, skipped, "annotation edits referenced missing highlights");
    }

    Ok(vec![
        FieldWrite::set("annotations", &maps.annotations)?,
        FieldWrite::set("strikethroughs", &maps.strikethroughs)?,
        FieldWrite::server_timestamp("last_action"),
    ])
}

/// Reason a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// An item was queued; flush after the debounce window.
    ItemQueued,
    /// Flush immediately (connectivity restored, page hidden, caller request).
    Now,
}

/// Builder for the background flush scheduler.
///
/// Call [`spawn`](Self::spawn) to start the task.
pub struct FlushScheduler {
    engine: Arc<FlushEngine>,
    debounce: Duration,
    policy: BackoffPolicy,
    online: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl FlushScheduler {
    /// Construct a scheduler (does not start it yet).
    #[must_use]
    pub fn new(
        engine: Arc<FlushEngine>,
        config: &SyncConfig,
        online: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            debounce: Duration::from_millis(config.debounce_ms),
            policy: BackoffPolicy::from(config),
            online,
            cancel,
        }
    }

    /// Spawn the scheduler task and return a handle for triggering it.
    #[must_use]
    pub fn spawn(self) -> FlushSchedulerHandle {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.clone();
        let session_id = self.engine.session_id.clone();
        let join_handle = tokio::spawn(
            self.run(trigger_rx)
                .instrument(info_span!("flush_scheduler", session_id = %session_id)),
        );
        FlushSchedulerHandle {
            trigger_tx,
            cancel,
            join_handle: Some(join_handle),
        }
    }

    async fn run(mut self, mut triggers: mpsc::UnboundedReceiver<FlushTrigger>) {
        loop {
            let trigger = tokio::select! {
                () = self.cancel.cancelled() => return,
                received = triggers.recv() => match received {
                    Some(trigger) => trigger,
                    None => return,
                },
                changed = self.online.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !*self.online.borrow_and_update() {
                        continue;
                    }
                    info!("connectivity restored; flushing queue");
                    FlushTrigger::Now
                }
            };

            if trigger == FlushTrigger::ItemQueued && !self.debounce(&mut triggers).await {
                return;
            }

            self.run_with_retry().await;
        }
    }

    /// Wait for a quiet period; further `ItemQueued` triggers restart it and
    /// `Now` cuts it short. Returns `false` if the scheduler should stop.
    async fn debounce(&self, triggers: &mut mpsc::UnboundedReceiver<FlushTrigger>) -> bool {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = tokio::time::sleep(self.debounce) => return true,
                received = triggers.recv() => match received {
                    Some(FlushTrigger::ItemQueued) => {}
                    Some(FlushTrigger::Now) => return true,
                    None => return false,
                },
            }
        }
    }

    async fn run_with_retry(&self) {
        for attempt in 1..=self.policy.max_attempts {
            if !*self.online.borrow() {
                debug!(attempt, "offline; flush deferred until connectivity returns");
                return;
            }

            match self.engine.flush().await {
                Ok(FlushOutcome::Skipped) => {
                    // Something else is flushing; run once more after it so
                    // items queued meanwhile are not stranded.
                    self.engine.wait_idle().await;
                }
                Ok(outcome) => {
                    debug!(?outcome, attempt, "flush finished");
                    return;
                }
                Err(err) => {
                    if !err.is_retryable() {
                        warn!(attempt, %err, "flush failed permanently; waiting for next trigger");
                        return;
                    }
                    if attempt == self.policy.max_attempts {
                        warn!(attempt, %err, "flush retries exhausted; waiting for next trigger");
                        return;
                    }
                    let delay = self.policy.delay_for(attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    warn!(attempt, delay_ms, %err, "flush failed; retrying");
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Handle returned from [`FlushScheduler::spawn`].
pub struct FlushSchedulerHandle {
    trigger_tx: mpsc::UnboundedSender<FlushTrigger>,
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl Drop for FlushSchedulerHandle {
    /// Cancel the background scheduler when the handle is dropped.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl FlushSchedulerHandle {
    /// Request a flush.
    pub fn trigger(&self, trigger: FlushTrigger) {
        if self.trigger_tx.send(trigger).is_err() {
            debug!("flush scheduler stopped; trigger dropped");
        }
    }

    /// Stop the scheduler and wait for it to exit.
    pub async fn await_completion(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}
