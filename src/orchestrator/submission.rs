//! Submission retry policy: flush, then create the result, retrying within
//! a bounded window.
//!
//! Phases: `Idle -> Submitting -> {Succeeded | TimedOut}`; a retry moves
//! `TimedOut` back to `Submitting` with a fresh window. The phase doubles as
//! the single-flight latch shared by manual and automatic submission.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SubmissionConfig;
use crate::models::result::SubmissionMetadata;
use crate::persistence::record_store::with_budget;
use crate::results::ResultService;
use crate::sync::flush::{FlushEngine, FlushOutcome};
use crate::{AppError, Result};

/// Submission state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitPhase {
    /// Nothing in flight.
    Idle,
    /// Retry loop running.
    Submitting,
    /// Result created.
    Succeeded {
        /// Created result id.
        result_id: String,
    },
    /// Window elapsed; waiting for an explicit retry.
    TimedOut,
}

/// What a submit or retry call achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The result exists.
    Submitted {
        /// Result id.
        result_id: String,
    },
    /// The window elapsed without success; call retry.
    TimedOut,
    /// Another submission is already running or awaiting retry.
    AlreadyInProgress,
    /// Offline: an automatic submission was queued for later, or the
    /// session closed mid-submission.
    Deferred,
}

/// Interval between attempts and the overall window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionPolicy {
    /// Wait after a failed attempt.
    pub retry_interval: Duration,
    /// Time after which the loop gives up and reports a timeout.
    pub window: Duration,
}

impl From<&SubmissionConfig> for SubmissionPolicy {
    fn from(config: &SubmissionConfig) -> Self {
        Self {
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            window: Duration::from_millis(config.window_ms),
        }
    }
}

/// Runs submissions for one session.
pub struct Submitter {
    session_id: String,
    engine: Arc<FlushEngine>,
    results: Arc<dyn ResultService>,
    write_budget: Duration,
    policy: SubmissionPolicy,
    phase: Mutex<SubmitPhase>,
}

impl Submitter {
    /// Create an idle submitter.
    #[must_use]
    pub fn new(
        session_id: String,
        engine: Arc<FlushEngine>,
        results: Arc<dyn ResultService>,
        write_budget: Duration,
        policy: SubmissionPolicy,
    ) -> Self {
        Self {
            session_id,
            engine,
            results,
            write_budget,
            policy,
            phase: Mutex::new(SubmitPhase::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubmitPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SubmitPhase {
        self.lock().clone()
    }

    /// `true` while submitting or timed out awaiting a retry.
    #[must_use]
    pub fn is_submitting(&self) -> bool {
        matches!(*self.lock(), SubmitPhase::Submitting | SubmitPhase::TimedOut)
    }

    /// Claim the single-flight latch: `Idle -> Submitting`.
    #[must_use]
    pub fn try_begin(&self) -> bool {
        let mut phase = self.lock();
        if *phase == SubmitPhase::Idle {
            *phase = SubmitPhase::Submitting;
            true
        } else {
            false
        }
    }

    /// `TimedOut -> Submitting`, for an explicit retry.
    #[must_use]
    pub fn resume_after_timeout(&self) -> bool {
        let mut phase = self.lock();
        if *phase == SubmitPhase::TimedOut {
            *phase = SubmitPhase::Submitting;
            true
        } else {
            false
        }
    }

    /// One attempt: flush pending items, then create the result.
    ///
    /// A failed flush fails the attempt, so the result is never created
    /// from a record that is missing queued answers.
    ///
    /// # Errors
    ///
    /// Returns the flush or result-creation error.
    pub async fn attempt(&self, metadata: &SubmissionMetadata) -> Result<String> {
        loop {
            match self.engine.flush().await? {
                FlushOutcome::Skipped => self.engine.wait_idle().await,
                FlushOutcome::Empty | FlushOutcome::Flushed { .. } => break,
            }
        }

        with_budget(
            self.write_budget,
            "result creation",
            self.results
                .create_test_result(&self.session_id, metadata.clone()),
        )
        .await
    }

    /// Retry [`attempt`](Self::attempt) every interval until it succeeds or
    /// the window elapses. The caller must hold the latch.
    ///
    /// `on_error` sees every failed attempt.
    pub async fn run(
        &self,
        metadata: &SubmissionMetadata,
        cancel: &CancellationToken,
        on_error: &(dyn Fn(&AppError) + Sync),
    ) -> SubmitOutcome {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.attempt(metadata).await {
                Ok(result_id) => {
                    info!(session_id = %self.session_id, attempt, %result_id, "test submitted");
                    *self.lock() = SubmitPhase::Succeeded {
                        result_id: result_id.clone(),
                    };
                    return SubmitOutcome::Submitted { result_id };
                }
                Err(err) => {
                    warn!(session_id = %self.session_id, attempt, %err, "submission attempt failed");
                    on_error(&err);
                }
            }

            if started.elapsed() >= self.policy.window {
                warn!(session_id = %self.session_id, attempt, "submission window elapsed");
                *self.lock() = SubmitPhase::TimedOut;
                return SubmitOutcome::TimedOut;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    *self.lock() = SubmitPhase::Idle;
                    return SubmitOutcome::Deferred;
                }
                () = tokio::time::sleep(self.policy.retry_interval) => {}
            }
        }
    }
}
