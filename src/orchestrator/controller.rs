//! Session controller: the single owner of one exam attempt in this process.
//!
//! Every mutating command updates the local record first, then queues the
//! change for the flush engine; the queue is the source of truth until a
//! flush confirms it. Background tasks (timer, heartbeat, guard listener,
//! flush scheduler) report to an event pump that keeps the published
//! [`SessionView`] current and reacts to expiry and reconnection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::channel::InstanceChannel;
use crate::config::{GlobalConfig, TimeoutConfig};
use crate::connectivity::Connectivity;
use crate::models::annotation::AnnotationOp;
use crate::models::layout::{QuestionRef, TestLayout};
use crate::models::queue::{
    ActionType, AnnotationUpdate, AnswerChange, AutoSubmit, FlagToggle, Navigation, QueueAction,
    QueueItem, TimerSync,
};
use crate::models::record::{session_id_for, SessionRecord, SessionStatus};
use crate::models::result::{SubmissionMetadata, SubmitTrigger};
use crate::persistence::queue_store::QueueStore;
use crate::persistence::record_store::{decode, with_budget, FieldWrite, RecordStore};
use crate::results::ResultService;
use crate::sync::flush::{FlushEngine, FlushOutcome, FlushScheduler, FlushSchedulerHandle, FlushTrigger};
use crate::sync::merge;
use crate::{AppError, Result};

use super::heartbeat::{HeartbeatEvent, HeartbeatHandle, HeartbeatMonitor};
use super::instance_guard::{GuardEvent, InstanceGuard, InstanceGuardHandle, OwnershipState};
use super::session_timer::{SessionTimer, TimerEvent};
use super::submission::{SubmissionPolicy, SubmitOutcome, SubmitPhase, Submitter};
use super::view::{Position, SessionView};

const EVENT_CAPACITY: usize = 32;

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionDeps {
    /// Local pending-mutation queue.
    pub queue: Arc<dyn QueueStore>,
    /// Shared remote record store.
    pub remote: Arc<dyn RecordStore>,
    /// Cross-instance claim channel for this session.
    pub channel: Arc<dyn InstanceChannel>,
    /// Result-creation service.
    pub results: Arc<dyn ResultService>,
    /// Online/offline signal.
    pub connectivity: Connectivity,
}

/// Which attempt to open.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Student.
    pub user_id: String,
    /// Test structure; its `test_id` completes the session id.
    pub layout: Arc<TestLayout>,
    /// Instance token override; a random one is generated when `None`.
    pub instance_token: Option<String>,
}

struct LocalState {
    record: SessionRecord,
    completed: bool,
    pending_auto_submit: bool,
    submit_error: Option<String>,
    submit_trigger: SubmitTrigger,
    first_submit_at: Option<DateTime<Utc>>,
    ticks_since_sync: u64,
}

struct Inner {
    session_id: String,
    layout: Arc<TestLayout>,
    sync_interval_ticks: u64,
    queue: Arc<dyn QueueStore>,
    connectivity: Connectivity,
    engine: Arc<FlushEngine>,
    scheduler: FlushSchedulerHandle,
    heartbeat: HeartbeatHandle,
    guard: InstanceGuardHandle,
    ownership: Arc<OwnershipState>,
    timer: SessionTimer,
    submitter: Submitter,
    state: Mutex<LocalState>,
    view: watch::Sender<SessionView>,
    /// Stops the event pump and any running submission.
    cancel: CancellationToken,
    /// Stops heartbeat, scheduler, timer and guard once the session completes.
    tasks_cancel: CancellationToken,
}

/// Handle to an open session.
///
/// Dropping the controller stops every background task; [`close`](Self::close)
/// additionally checkpoints the timer and attempts a final flush.
pub struct SessionController {
    inner: Arc<Inner>,
    pump: Option<JoinHandle<()>>,
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl SessionController {
    /// Open (creating if absent) the attempt for `params`, overlay any
    /// pending queue items, claim ownership and start background tasks.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionCompleted` if the attempt was already submitted.
    /// - `AppError::Config` if the stored position does not fit the layout.
    /// - The remote error if the record cannot be created or read.
    #[allow(clippy::too_many_lines)] // Startup wires every background task in order.
    pub async fn open(
        config: &GlobalConfig,
        deps: SessionDeps,
        params: SessionParams,
    ) -> Result<Self> {
        let layout = params.layout;
        let session_id = session_id_for(&params.user_id, &layout.test_id);
        let timeouts = config.timeouts;

        let mut record =
            load_or_create(deps.remote.as_ref(), &params.user_id, &layout, timeouts).await?;
        if record.is_completed() {
            discard_auto_submits(deps.queue.as_ref(), &session_id).await;
            return Err(AppError::SessionCompleted(format!(
                "session {session_id} was already submitted"
            )));
        }

        let pending = match deps.queue.list_pending(&session_id, None).await {
            Ok(items) => items,
            Err(err) => {
                warn!(%session_id, %err, "pending queue unreadable; opening without overlay");
                Vec::new()
            }
        };
        let pending_auto_submit = pending
            .iter()
            .any(|item| item.action_type() == ActionType::AutoSubmit);
        let overlay = merge::plan(&pending);
        overlay.apply_to(&mut record);

        let section_index = record.current_section_index;
        let section = layout.section(section_index).ok_or_else(|| {
            AppError::Config(format!(
                "stored section {section_index} is outside test {}",
                layout.test_id
            ))
        })?;
        if record.current_sub_question_label.is_none() {
            record.current_sub_question_label = layout
                .question(section_index, record.current_question_index)
                .and_then(QuestionRef::first_label);
        }
        let remaining = record
            .time_remaining(section_index)
            .unwrap_or(section.time_limit_seconds);

        let cancel = CancellationToken::new();
        let tasks_cancel = cancel.child_token();

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let timer = SessionTimer::new(
            remaining,
            Duration::from_millis(config.timer.tick_ms),
            timer_tx,
            tasks_cancel.child_token(),
        );

        let ownership = Arc::new(
            params
                .instance_token
                .map_or_else(OwnershipState::new, OwnershipState::with_token),
        );
        ownership.set_previous_owner(record.ownership_token.clone());
        let (guard_tx, guard_rx) = mpsc::channel(EVENT_CAPACITY);
        let guard = InstanceGuard::new(
            session_id.clone(),
            deps.channel,
            Arc::clone(&deps.remote),
            Arc::clone(&ownership),
            Duration::from_millis(config.claim.settle_ms),
            timeouts.write(),
            guard_tx,
            tasks_cancel.child_token(),
        )
        .spawn();
        if let Err(err) = guard.claim().await {
            warn!(%session_id, %err, "ownership claim not written; heartbeat will retry");
        }

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(EVENT_CAPACITY);
        let heartbeat = HeartbeatMonitor::new(
            session_id.clone(),
            Arc::clone(&deps.remote),
            Arc::clone(&ownership),
            &config.heartbeat,
            timeouts,
            heartbeat_tx,
            tasks_cancel.child_token(),
        )
        .spawn();

        let engine = Arc::new(FlushEngine::new(
            session_id.clone(),
            Arc::clone(&deps.queue),
            Arc::clone(&deps.remote),
            timeouts,
        ));
        let scheduler = FlushScheduler::new(
            Arc::clone(&engine),
            &config.sync,
            deps.connectivity.subscribe(),
            tasks_cancel.child_token(),
        )
        .spawn();

        let submitter = Submitter::new(
            session_id.clone(),
            Arc::clone(&engine),
            deps.results,
            timeouts.write(),
            SubmissionPolicy::from(&config.submission),
        );

        let (view, _) = watch::channel(SessionView::default());
        let inner = Arc::new(Inner {
            session_id: session_id.clone(),
            layout,
            sync_interval_ticks: config.timer.sync_interval_seconds,
            queue: deps.queue,
            connectivity: deps.connectivity,
            engine,
            scheduler,
            heartbeat,
            guard,
            ownership,
            timer,
            submitter,
            state: Mutex::new(LocalState {
                record,
                completed: false,
                pending_auto_submit,
                submit_error: None,
                submit_trigger: SubmitTrigger::Manual,
                first_submit_at: None,
                ticks_since_sync: 0,
            }),
            view,
            cancel,
            tasks_cancel,
        });

        inner.timer.start();
        if !overlay.is_empty() {
            inner.scheduler.trigger(FlushTrigger::Now);
        }
        inner.publish();

        let pump = tokio::spawn(
            Arc::clone(&inner)
                .pump(timer_rx, heartbeat_rx, guard_rx, pending_auto_submit)
                .instrument(info_span!("session_controller", session_id = %session_id)),
        );

        info!(%session_id, pending = pending.len(), "session opened");
        Ok(Self {
            inner,
            pump: Some(pump),
        })
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// This instance's ownership token.
    #[must_use]
    pub fn instance_token(&self) -> &str {
        self.inner.ownership.token()
    }

    /// Latest view snapshot.
    #[must_use]
    pub fn view(&self) -> SessionView {
        self.inner.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.inner.view.subscribe()
    }

    /// Local copy of the record, including unflushed changes.
    #[must_use]
    pub fn record(&self) -> SessionRecord {
        self.inner.lock().record.clone()
    }

    /// Set (`Some`) or clear (`None`) the answer at the current position.
    ///
    /// # Errors
    ///
    /// `AppError::SessionCompleted` or `AppError::Takeover` when blocked.
    pub async fn set_answer(&self, value: Option<String>) -> Result<()> {
        self.inner.ensure_writable()?;
        let (question_id, sub_question_label) = self.inner.current_question()?;
        self.inner
            .commit(QueueAction::AnswerChange(AnswerChange {
                question_id,
                sub_question_label,
                value,
            }))
            .await;
        Ok(())
    }

    /// Flip the review flag on the current question; returns the new state.
    ///
    /// # Errors
    ///
    /// `AppError::SessionCompleted` or `AppError::Takeover` when blocked.
    pub async fn toggle_flag(&self) -> Result<bool> {
        self.inner.ensure_writable()?;
        let (question_id, _) = self.inner.current_question()?;
        let flagged = !self.inner.lock().record.is_flagged(&question_id);
        self.inner
            .commit(QueueAction::FlagToggle(FlagToggle {
                question_id,
                flagged,
            }))
            .await;
        Ok(flagged)
    }

    /// Apply an annotation edit to the current question.
    ///
    /// # Errors
    ///
    /// `AppError::SessionCompleted` or `AppError::Takeover` when blocked.
    pub async fn annotate(&self, op: AnnotationOp) -> Result<()> {
        self.inner.ensure_writable()?;
        let (question_id, _) = self.inner.current_question()?;
        self.inner
            .commit(QueueAction::AnnotationUpdate(AnnotationUpdate { question_id, op }))
            .await;
        Ok(())
    }

    /// Move to the next question in the current section. Stays put on the last one.
    ///
    /// # Errors
    ///
    /// `AppError::SessionCompleted` or `AppError::Takeover` when blocked.
    pub async fn go_next(&self) -> Result<Position> {
        self.inner.step(1).await
    }

    /// Move to the previous question in the current section. Stays put on the first one.
    ///
    /// # Errors
    ///
    /// `AppError::SessionCompleted` or `AppError::Takeover` when blocked.
    pub async fn go_previous(&self) -> Result<Position> {
        self.inner.step(-1).await
    }

    /// Select a sub-question of the current question.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the question has no such label.
    /// - `AppError::SessionCompleted` or `AppError::Takeover` when blocked.
    pub async fn select_sub_question(&self, label: &str) -> Result<()> {
        self.inner.ensure_writable()?;
        let (section_index, question_index) = self.inner.position();
        let known = self
            .inner
            .layout
            .question(section_index, question_index)
            .is_some_and(|question| question.sub_questions.iter().any(|l| l == label));
        if !known {
            return Err(AppError::NotFound(format!(
                "sub-question {label} not in current question"
            )));
        }
        self.inner
            .commit(QueueAction::Navigation(Navigation {
                section_index,
                question_index,
                sub_question_label: Some(label.to_owned()),
            }))
            .await;
        Ok(())
    }

    /// Submit the test: flush, then create the result, retrying within the
    /// configured window.
    ///
    /// # Errors
    ///
    /// `AppError::SessionCompleted` or `AppError::Takeover` when blocked.
    pub async fn submit_test(&self) -> Result<SubmitOutcome> {
        self.inner.submit(SubmitTrigger::Manual).await
    }

    /// Restart the retry loop after a timed-out submission.
    ///
    /// # Errors
    ///
    /// `AppError::SessionCompleted` or `AppError::Takeover` when blocked.
    pub async fn retry_submit(&self) -> Result<SubmitOutcome> {
        self.inner.retry_submit().await
    }

    /// Reclaim a session another instance claimed or took over.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionCompleted` once submitted.
    /// - The remote error if the token write fails; the heartbeat retries it.
    pub async fn take_control(&self) -> Result<()> {
        if self.inner.lock().completed {
            return Err(completed_error(&self.inner.session_id));
        }
        let claimed = self.inner.guard.take_control().await;
        self.inner.heartbeat.beat_now();
        self.inner.publish();
        claimed
    }

    /// The page became visible: re-assert ownership now.
    pub fn notify_visible(&self) {
        self.inner.heartbeat.beat_now();
        self.inner.publish();
    }

    /// The page is being hidden: flush without waiting for the debounce.
    pub fn notify_hidden(&self) {
        self.inner.scheduler.trigger(FlushTrigger::Now);
    }

    /// Flush pending items immediately.
    ///
    /// # Errors
    ///
    /// The flush error; items stay queued.
    pub async fn flush_now(&self) -> Result<FlushOutcome> {
        let outcome = self.inner.engine.flush().await;
        self.inner.publish();
        outcome
    }

    /// Checkpoint the timer, attempt a last flush and stop every task.
    pub async fn close(mut self) {
        let completed = self.inner.lock().completed;
        if !completed && !self.inner.ownership.has_yielded() {
            let (section_index, _) = self.inner.position();
            self.inner
                .commit(QueueAction::TimerSync(TimerSync {
                    section_index,
                    remaining_seconds: self.inner.timer.remaining(),
                }))
                .await;
            if self.inner.connectivity.is_online() {
                if let Err(err) = self.inner.engine.flush().await {
                    warn!(session_id = %self.inner.session_id, %err, "final flush failed; items stay queued");
                }
            }
        }

        self.inner.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        info!(session_id = %self.inner.session_id, "session closed");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn position(&self) -> (usize, usize) {
        let state = self.lock();
        (
            state.record.current_section_index,
            state.record.current_question_index,
        )
    }

    fn ensure_owner(&self) -> Result<()> {
        if self.ownership.is_invalidated() {
            return Err(AppError::Takeover(
                "session was claimed by another instance".into(),
            ));
        }
        if self.ownership.is_taken_over() {
            return Err(AppError::Takeover(
                "session is owned by another instance".into(),
            ));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.lock().completed {
            return Err(completed_error(&self.session_id));
        }
        self.ensure_owner()
    }

    /// Question id and effective sub-question label at the current position.
    fn current_question(&self) -> Result<(String, Option<String>)> {
        let state = self.lock();
        let record = &state.record;
        let question = self
            .layout
            .question(record.current_section_index, record.current_question_index)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "no question at section {} index {}",
                    record.current_section_index, record.current_question_index
                ))
            })?;
        let label = if question.sub_questions.is_empty() {
            None
        } else {
            record
                .current_sub_question_label
                .clone()
                .or_else(|| question.first_label())
        };
        Ok((question.id.clone(), label))
    }

    /// Apply `action` locally, queue it and schedule a flush.
    ///
    /// A queue failure is logged; the local state keeps the change.
    async fn commit(&self, action: QueueAction) {
        let item = QueueItem::new(self.session_id.clone(), action);
        merge::plan(std::slice::from_ref(&item)).apply_to(&mut self.lock().record);

        match self.queue.add(&item).await {
            Ok(_) => self.scheduler.trigger(FlushTrigger::ItemQueued),
            Err(err) => {
                warn!(session_id = %self.session_id, action = ?item.action_type(), %err, "failed to queue change");
            }
        }
        self.publish();
    }

    async fn step(&self, delta: isize) -> Result<Position> {
        self.ensure_writable()?;
        let (section_index, question_index) = self.position();
        let count = self
            .layout
            .section(section_index)
            .map_or(0, |section| section.questions.len());

        let target = question_index
            .checked_add_signed(delta)
            .filter(|index| *index < count);
        if let Some(question_index) = target {
            let sub_question_label = self
                .layout
                .question(section_index, question_index)
                .and_then(QuestionRef::first_label);
            self.commit(QueueAction::Navigation(Navigation {
                section_index,
                question_index,
                sub_question_label,
            }))
            .await;
        }
        Ok(self.view.borrow().position.clone())
    }

    fn publish(&self) {
        let phase = self.submitter.phase();
        let view = {
            let state = self.lock();
            let record = &state.record;
            let position = Position {
                section_index: record.current_section_index,
                question_index: record.current_question_index,
                sub_question_label: record.current_sub_question_label.clone(),
            };
            let question = self
                .layout
                .question(position.section_index, position.question_index);
            let current_answer = question.and_then(|question| {
                let label = if question.sub_questions.is_empty() {
                    None
                } else {
                    position.sub_question_label.as_deref()
                };
                record.answer_for(&question.id, label).map(str::to_owned)
            });

            SessionView {
                question_id: question.map(|question| question.id.clone()),
                current_answer,
                flags: record.flagged_questions.clone(),
                time_remaining: self.timer.remaining(),
                is_connected: self.heartbeat.is_connected(),
                is_syncing: self.engine.is_flushing(),
                is_invalidated: self.ownership.is_invalidated(),
                session_taken_over: self.ownership.is_taken_over(),
                submit_error: state.submit_error.clone(),
                is_submit_timed_out: phase == SubmitPhase::TimedOut,
                is_submitting: matches!(phase, SubmitPhase::Submitting | SubmitPhase::TimedOut),
                result_id: match &phase {
                    SubmitPhase::Succeeded { result_id } => Some(result_id.clone()),
                    _ => None,
                },
                pending_auto_submit: state.pending_auto_submit,
                durable_queue: self.queue.is_durable(),
                is_completed: state.completed,
                position,
            }
        };

        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    async fn pump(
        self: Arc<Self>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
        mut heartbeat_rx: mpsc::Receiver<HeartbeatEvent>,
        mut guard_rx: mpsc::Receiver<GuardEvent>,
        replay_auto_submit: bool,
    ) {
        let mut online = self.connectivity.subscribe();
        let mut syncing = self.engine.subscribe_syncing();

        if replay_auto_submit && *online.borrow_and_update() {
            self.spawn_auto_submit_replay();
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("event pump cancelled");
                    return;
                }
                Some(event) = timer_rx.recv() => self.on_timer(event).await,
                Some(event) = heartbeat_rx.recv() => {
                    debug!(?event, "heartbeat event");
                    self.publish();
                }
                Some(event) = guard_rx.recv() => {
                    debug!(?event, "guard event");
                    self.publish();
                }
                Ok(()) = online.changed() => {
                    let is_online = *online.borrow_and_update();
                    info!(is_online, "connectivity changed");
                    if is_online {
                        self.spawn_auto_submit_replay();
                    }
                    self.publish();
                }
                Ok(()) = syncing.changed() => {
                    syncing.borrow_and_update();
                    self.publish();
                }
            }
        }
    }

    async fn on_timer(self: &Arc<Self>, event: TimerEvent) {
        match event {
            TimerEvent::Tick { remaining } => {
                let checkpoint = {
                    let mut state = self.lock();
                    state.ticks_since_sync += 1;
                    if state.completed || state.ticks_since_sync < self.sync_interval_ticks {
                        None
                    } else {
                        state.ticks_since_sync = 0;
                        Some(state.record.current_section_index)
                    }
                };
                if let Some(section_index) = checkpoint {
                    if !self.ownership.has_yielded() {
                        self.commit(QueueAction::TimerSync(TimerSync {
                            section_index,
                            remaining_seconds: remaining,
                        }))
                        .await;
                    }
                }
                self.publish();
            }
            TimerEvent::Expired => self.on_expired().await,
        }
    }

    async fn on_expired(self: &Arc<Self>) {
        if self.lock().completed {
            return;
        }
        if self.ownership.has_yielded() {
            info!(session_id = %self.session_id, "countdown expired while another instance owns the session");
            return;
        }

        let (section_index, _) = self.position();
        self.commit(QueueAction::TimerSync(TimerSync {
            section_index,
            remaining_seconds: 0,
        }))
        .await;

        if !self.layout.is_last_section(section_index) {
            let next = section_index + 1;
            let seconds = {
                let state = self.lock();
                state.record.time_remaining(next).unwrap_or_else(|| {
                    self.layout
                        .section(next)
                        .map_or(0, |section| section.time_limit_seconds)
                })
            };
            info!(session_id = %self.session_id, section = next, seconds, "section time up; advancing");
            self.commit(QueueAction::Navigation(Navigation {
                section_index: next,
                question_index: 0,
                sub_question_label: self
                    .layout
                    .question(next, 0)
                    .and_then(QuestionRef::first_label),
            }))
            .await;
            self.timer.reset(seconds);
            self.timer.start();
            self.publish();
            return;
        }

        if !self.connectivity.is_online() {
            info!(session_id = %self.session_id, "time up while offline; deferring submission");
            self.commit(QueueAction::AutoSubmit(AutoSubmit { section_index }))
                .await;
            self.lock().pending_auto_submit = true;
            self.publish();
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = inner.submit(SubmitTrigger::TimerExpired).await {
                warn!(session_id = %inner.session_id, %err, "automatic submission rejected");
            }
        });
    }

    fn spawn_auto_submit_replay(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.replay_auto_submit().await });
    }

    async fn replay_auto_submit(self: Arc<Self>) {
        let items = match self
            .queue
            .list_pending(&self.session_id, Some(ActionType::AutoSubmit))
            .await
        {
            Ok(items) => items,
            Err(err) => {
                warn!(session_id = %self.session_id, %err, "could not read deferred submissions");
                return;
            }
        };
        if items.is_empty() {
            return;
        }
        if self.lock().completed {
            discard_auto_submits(self.queue.as_ref(), &self.session_id).await;
            return;
        }

        info!(session_id = %self.session_id, "replaying deferred automatic submission");
        match self.submit(SubmitTrigger::Recovered).await {
            Ok(outcome) => debug!(?outcome, "deferred submission finished"),
            Err(err) => warn!(session_id = %self.session_id, %err, "deferred submission rejected"),
        }
    }

    async fn submit(self: &Arc<Self>, trigger: SubmitTrigger) -> Result<SubmitOutcome> {
        self.ensure_owner()?;
        if let SubmitPhase::Succeeded { result_id } = self.submitter.phase() {
            return Ok(SubmitOutcome::Submitted { result_id });
        }
        if self.lock().completed {
            return Err(completed_error(&self.session_id));
        }
        if !self.submitter.try_begin() {
            return Ok(SubmitOutcome::AlreadyInProgress);
        }

        self.timer.pause();
        {
            let mut state = self.lock();
            state.submit_error = None;
            state.submit_trigger = trigger;
            state.first_submit_at.get_or_insert_with(Utc::now);
        }
        self.publish();
        Ok(self.run_submission().await)
    }

    async fn retry_submit(self: &Arc<Self>) -> Result<SubmitOutcome> {
        self.ensure_owner()?;
        if let SubmitPhase::Succeeded { result_id } = self.submitter.phase() {
            return Ok(SubmitOutcome::Submitted { result_id });
        }
        if self.lock().completed {
            return Err(completed_error(&self.session_id));
        }
        if !self.submitter.resume_after_timeout() {
            if self.submitter.is_submitting() {
                return Ok(SubmitOutcome::AlreadyInProgress);
            }
            return self.submit(SubmitTrigger::Manual).await;
        }

        self.lock().submit_error = None;
        self.publish();
        Ok(self.run_submission().await)
    }

    async fn run_submission(self: &Arc<Self>) -> SubmitOutcome {
        let metadata = {
            let state = self.lock();
            SubmissionMetadata {
                user_id: state.record.user_id.clone(),
                test_id: state.record.test_id.clone(),
                trigger: state.submit_trigger,
                instance_token: self.ownership.token().to_owned(),
                client_submitted_at: state.first_submit_at.unwrap_or_else(Utc::now),
            }
        };

        let outcome = self
            .submitter
            .run(&metadata, &self.cancel, &|err| {
                self.lock().submit_error = Some(err.to_string());
                self.publish();
            })
            .await;

        if matches!(outcome, SubmitOutcome::Submitted { .. }) {
            self.finish_completed().await;
        }
        self.publish();
        outcome
    }

    async fn finish_completed(&self) {
        {
            let mut state = self.lock();
            state.completed = true;
            state.record.status = SessionStatus::Completed;
            state.submit_error = None;
            state.pending_auto_submit = false;
        }
        self.tasks_cancel.cancel();
        discard_auto_submits(self.queue.as_ref(), &self.session_id).await;
        info!(session_id = %self.session_id, "session completed; background tasks stopped");
    }
}

fn completed_error(session_id: &str) -> AppError {
    AppError::SessionCompleted(format!("session {session_id} was already submitted"))
}

/// Create the record for a first attempt, or load and resume an existing one.
async fn load_or_create(
    remote: &dyn RecordStore,
    user_id: &str,
    layout: &TestLayout,
    timeouts: TimeoutConfig,
) -> Result<SessionRecord> {
    let session_id = session_id_for(user_id, &layout.test_id);

    let mut fresh = SessionRecord::new(user_id, &layout.test_id, layout);
    fresh.status = SessionStatus::InProgress;
    let mut writes = FieldWrite::document(&fresh)?;
    writes.push(FieldWrite::server_timestamp("started_at"));

    let created = with_budget(
        timeouts.write(),
        "session create",
        remote.create_if_absent(&session_id, writes),
    )
    .await?;

    let doc = with_budget(timeouts.read(), "session load", remote.get(&session_id)).await?;
    let mut record: SessionRecord = decode(doc)?
        .ok_or_else(|| AppError::NotFound(format!("session {session_id} vanished after create")))?;

    if created {
        info!(%session_id, "session record created");
    } else if record.can_transition_to(SessionStatus::InProgress) {
        with_budget(
            timeouts.write(),
            "session resume",
            remote.update(
                &session_id,
                vec![
                    FieldWrite::set("status", SessionStatus::InProgress)?,
                    FieldWrite::server_timestamp("last_action"),
                ],
            ),
        )
        .await?;
        record.status = SessionStatus::InProgress;
        info!(%session_id, "session resumed");
    }

    Ok(record)
}

async fn discard_auto_submits(queue: &dyn QueueStore, session_id: &str) {
    let ids: Vec<String> = match queue
        .list_pending(session_id, Some(ActionType::AutoSubmit))
        .await
    {
        Ok(items) => items.into_iter().map(|item| item.id).collect(),
        Err(err) => {
            warn!(session_id, %err, "could not list deferred submissions");
            return;
        }
    };
    if ids.is_empty() {
        return;
    }
    if let Err(err) = queue.delete_many(&ids).await {
        warn!(session_id, %err, "could not delete deferred submissions");
    }
}
