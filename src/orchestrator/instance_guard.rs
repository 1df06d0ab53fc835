//! Duplicate-instance guard: announce a claim on a session-scoped channel,
//! then write the claiming token to the record.
//!
//! This is a race, not a lock. Two instances claiming at once both write;
//! the heartbeat converges them onto whichever token landed last.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::channel::{ClaimMessage, InstanceChannel};
use crate::persistence::record_store::{with_budget, FieldWrite, RecordStore};
use crate::Result;

/// Ownership flags shared between the guard, the heartbeat and the controller.
#[derive(Debug)]
pub struct OwnershipState {
    token: String,
    claimed: AtomicBool,
    invalidated: AtomicBool,
    taken_over: AtomicBool,
    displacing: AtomicBool,
    previous_owner: Mutex<Option<String>>,
    reclaimed: Notify,
}

impl OwnershipState {
    /// Fresh state with a new random instance token.
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(Uuid::new_v4().to_string())
    }

    /// Fresh state with a caller-chosen token.
    #[must_use]
    pub fn with_token(token: String) -> Self {
        Self {
            token,
            claimed: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            taken_over: AtomicBool::new(false),
            displacing: AtomicBool::new(false),
            previous_owner: Mutex::new(None),
            reclaimed: Notify::new(),
        }
    }

    /// This instance's identity token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether our token has been written to the record since the last (re)claim.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Whether a sibling announced a claim over the channel.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Whether the heartbeat found a foreign token on the record.
    #[must_use]
    pub fn is_taken_over(&self) -> bool {
        self.taken_over.load(Ordering::SeqCst)
    }

    /// Either flag: this instance must not write until the user takes control.
    #[must_use]
    pub fn has_yielded(&self) -> bool {
        self.is_invalidated() || self.is_taken_over()
    }

    /// Record that the heartbeat saw a foreign owner. Returns `true` on the
    /// first observation.
    #[must_use]
    pub fn mark_taken_over(&self) -> bool {
        !self.taken_over.swap(true, Ordering::SeqCst)
    }

    fn mark_invalidated(&self) -> bool {
        !self.invalidated.swap(true, Ordering::SeqCst)
    }

    fn set_claimed(&self, claimed: bool) {
        self.claimed.store(claimed, Ordering::SeqCst);
    }

    /// Record the owner token found on the record when the session was
    /// loaded. Until our claim lands, only that token may be overwritten.
    pub fn set_previous_owner(&self, token: Option<String>) {
        *self
            .previous_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Whether an unclaimed instance may write its token over `current`.
    ///
    /// Always `false` once claimed. Before that, only the owner seen at load
    /// time may be replaced, or any owner while taking control.
    #[must_use]
    pub fn may_displace(&self, current: &str) -> bool {
        if self.is_claimed() {
            return false;
        }
        if self.displacing.load(Ordering::SeqCst) {
            return true;
        }
        self.previous_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(current)
    }

    /// Mark our token as written to the record.
    pub fn complete_claim(&self) {
        self.displacing.store(false, Ordering::SeqCst);
        self.set_claimed(true);
    }

    /// Clear both yield flags and wake anything waiting for a reclaim.
    fn clear_yield(&self) {
        self.invalidated.store(false, Ordering::SeqCst);
        self.taken_over.store(false, Ordering::SeqCst);
        self.reclaimed.notify_one();
    }

    /// Wait until [`InstanceGuardHandle::take_control`] clears the yield flags.
    ///
    /// May return spuriously; callers re-check [`has_yielded`](Self::has_yielded).
    pub async fn reclaimed(&self) {
        self.reclaimed.notified().await;
    }
}

impl Default for OwnershipState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events raised by the guard's channel listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    /// A sibling instance announced a claim on this session.
    Invalidated {
        /// The sibling's token.
        foreign_token: String,
    },
}

/// Builder for the per-session instance guard.
pub struct InstanceGuard {
    session_id: String,
    channel: Arc<dyn InstanceChannel>,
    remote: Arc<dyn RecordStore>,
    ownership: Arc<OwnershipState>,
    settle: Duration,
    write_budget: Duration,
    event_tx: mpsc::Sender<GuardEvent>,
    cancel: CancellationToken,
}

impl InstanceGuard {
    /// Construct a guard (does not subscribe yet).
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        session_id: String,
        channel: Arc<dyn InstanceChannel>,
        remote: Arc<dyn RecordStore>,
        ownership: Arc<OwnershipState>,
        settle: Duration,
        write_budget: Duration,
        event_tx: mpsc::Sender<GuardEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            channel,
            remote,
            ownership,
            settle,
            write_budget,
            event_tx,
            cancel,
        }
    }

    /// Subscribe to the session channel and spawn the listener.
    ///
    /// The subscription is taken before this returns, so claims announced
    /// by siblings afterwards are never missed.
    #[must_use]
    pub fn spawn(self) -> InstanceGuardHandle {
        let receiver = self.channel.subscribe();
        let listener = tokio::spawn(
            Self::listen(
                self.session_id.clone(),
                receiver,
                Arc::clone(&self.ownership),
                self.event_tx,
                self.cancel.clone(),
            )
            .instrument(info_span!("instance_guard")),
        );

        InstanceGuardHandle {
            session_id: self.session_id,
            channel: self.channel,
            remote: self.remote,
            ownership: self.ownership,
            settle: self.settle,
            write_budget: self.write_budget,
            cancel: self.cancel,
            join_handle: Some(listener),
        }
    }

    async fn listen(
        session_id: String,
        mut receiver: broadcast::Receiver<ClaimMessage>,
        ownership: Arc<OwnershipState>,
        event_tx: mpsc::Sender<GuardEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(session_id, "instance guard cancelled");
                    return;
                }
                received = receiver.recv() => received,
            };

            match message {
                Ok(ClaimMessage::SessionClaimed { token }) => {
                    if token == ownership.token() {
                        continue;
                    }
                    if ownership.mark_invalidated() {
                        info!(session_id, foreign_token = %token, "session claimed by another instance");
                        let _ = event_tx
                            .send(GuardEvent::Invalidated {
                                foreign_token: token,
                            })
                            .await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session_id, skipped, "claim listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Handle returned from [`InstanceGuard::spawn`].
pub struct InstanceGuardHandle {
    session_id: String,
    channel: Arc<dyn InstanceChannel>,
    remote: Arc<dyn RecordStore>,
    ownership: Arc<OwnershipState>,
    settle: Duration,
    write_budget: Duration,
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl Drop for InstanceGuardHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl InstanceGuardHandle {
    /// Shared ownership flags.
    #[must_use]
    pub fn ownership(&self) -> Arc<OwnershipState> {
        Arc::clone(&self.ownership)
    }

    /// Announce, wait the settle delay, then write our token.
    ///
    /// # Errors
    ///
    /// Returns the remote error if the token write fails or times out; the
    /// announcement has still been made and the heartbeat will write the
    /// token on its next beat.
    pub async fn claim(&self) -> Result<()> {
        let token = self.ownership.token().to_owned();
        self.channel.publish(ClaimMessage::SessionClaimed {
            token: token.clone(),
        });

        tokio::time::sleep(self.settle).await;

        with_budget(
            self.write_budget,
            "ownership claim",
            self.remote.update(
                &self.session_id,
                vec![FieldWrite::value("ownership_token", token.into())],
            ),
        )
        .await?;

        self.ownership.complete_claim();
        info!(session_id = %self.session_id, "session claimed");
        Ok(())
    }

    /// Clear the invalidated and taken-over flags and claim again.
    ///
    /// # Errors
    ///
    /// See [`claim`](Self::claim).
    pub async fn take_control(&self) -> Result<()> {
        // Unclaimed and displacing while re-claiming, so the heartbeat
        // overwrites the sibling's token instead of reporting a takeover.
        self.ownership.set_claimed(false);
        self.ownership.displacing.store(true, Ordering::SeqCst);
        self.ownership.clear_yield();
        info!(session_id = %self.session_id, "taking control of session");
        self.claim().await
    }

    /// Stop the listener and wait for it to exit.
    pub async fn await_completion(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}
