//! Section countdown with an exactly-once expiry signal.
//!
//! The ticker task and any manual [`SessionTimer::advance`] calls share one
//! state; the `Expired` event is guarded by a per-countdown latch, so a
//! second ticker, a repeated `start` or a racing manual tick cannot fire it
//! twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Countdown phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Created or reset; not counting.
    Idle,
    /// Counting down.
    Running,
    /// Suspended; `resume` continues from the same remaining time.
    Paused,
    /// Reached zero. Terminal until `reset`.
    Expired,
}

/// Events emitted by the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// One second elapsed.
    Tick {
        /// Seconds left after this tick.
        remaining: u64,
    },
    /// The countdown reached zero.
    Expired,
}

struct TimerState {
    phase: TimerPhase,
    remaining: u64,
    /// Bumped whenever the running ticker must stop.
    generation: u64,
    latch: Arc<AtomicBool>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    event_tx: mpsc::UnboundedSender<TimerEvent>,
    tick: Duration,
    cancel: CancellationToken,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance one tick. `generation` restricts the tick to one ticker;
    /// `None` ticks whichever countdown is running. Returns `false` once the
    /// caller's ticker should stop.
    fn tick(&self, generation: Option<u64>) -> bool {
        let (remaining, latch) = {
            let mut state = self.lock();
            if state.phase != TimerPhase::Running
                || generation.is_some_and(|g| g != state.generation)
            {
                return false;
            }
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining == 0 {
                state.phase = TimerPhase::Expired;
            }
            (state.remaining, Arc::clone(&state.latch))
        };

        let _ = self.event_tx.send(TimerEvent::Tick { remaining });

        if remaining == 0 {
            if !latch.swap(true, Ordering::SeqCst) {
                info!("countdown expired");
                let _ = self.event_tx.send(TimerEvent::Expired);
            }
            return false;
        }
        true
    }
}

/// Section countdown.
///
/// Dropping the timer stops its ticker.
pub struct SessionTimer {
    shared: Arc<TimerShared>,
}

impl SessionTimer {
    /// Create an idle timer with `initial_seconds` on the clock.
    #[must_use]
    pub fn new(
        initial_seconds: u64,
        tick: Duration,
        event_tx: mpsc::UnboundedSender<TimerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    phase: TimerPhase::Idle,
                    remaining: initial_seconds,
                    generation: 0,
                    latch: Arc::new(AtomicBool::new(false)),
                }),
                event_tx,
                tick,
                cancel,
            }),
        }
    }

    /// Begin counting. No-op unless idle.
    pub fn start(&self) {
        let generation = {
            let mut state = self.shared.lock();
            if state.phase != TimerPhase::Idle {
                debug!(phase = ?state.phase, "timer start ignored");
                return;
            }
            state.phase = TimerPhase::Running;
            state.generation += 1;
            state.generation
        };
        self.spawn_ticker(generation);
    }

    /// Suspend counting. No-op unless running.
    pub fn pause(&self) {
        let mut state = self.shared.lock();
        if state.phase == TimerPhase::Running {
            state.phase = TimerPhase::Paused;
            state.generation += 1;
        }
    }

    /// Continue after [`pause`](Self::pause). No-op unless paused, so a
    /// resume after expiry does nothing.
    pub fn resume(&self) {
        let generation = {
            let mut state = self.shared.lock();
            if state.phase != TimerPhase::Paused {
                return;
            }
            state.phase = TimerPhase::Running;
            state.generation += 1;
            state.generation
        };
        self.spawn_ticker(generation);
    }

    /// Stop any countdown and return to idle with `seconds` on the clock and
    /// a fresh expiry latch.
    pub fn reset(&self, seconds: u64) {
        let mut state = self.shared.lock();
        state.phase = TimerPhase::Idle;
        state.remaining = seconds;
        state.generation += 1;
        state.latch = Arc::new(AtomicBool::new(false));
    }

    /// Advance one tick immediately, as the ticker would.
    pub fn advance(&self) {
        self.shared.tick(None);
    }

    /// Seconds left.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.shared.lock().remaining
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> TimerPhase {
        self.shared.lock().phase
    }

    fn spawn_ticker(&self, generation: u64) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(shared.tick);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately.
                interval.tick().await;
                loop {
                    tokio::select! {
                        () = shared.cancel.cancelled() => return,
                        _ = interval.tick() => {}
                    }
                    if !shared.tick(Some(generation)) {
                        return;
                    }
                }
            }
            .instrument(info_span!("session_timer", generation)),
        );
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
