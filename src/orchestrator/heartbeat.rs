//! Periodic ownership re-assertion against the shared session record.
//!
//! Each beat reads `ownership_token`. A foreign token means another
//! instance won: the monitor reports a takeover and pauses until the user
//! takes control. Otherwise it writes `last_heartbeat` and our token, unless
//! a sibling's claim announcement invalidated us, in which case it only
//! keeps reading until that sibling's token lands. Consecutive failures
//! past a threshold flip the connection indicator; failures never imply a
//! takeover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{HeartbeatConfig, TimeoutConfig};
use crate::persistence::record_store::{with_budget, FieldWrite, RecordStore};
use crate::Result;

use super::instance_guard::OwnershipState;

/// Events emitted by the heartbeat for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// The record names another instance as owner.
    TakenOver {
        /// Token found on the record.
        foreign_token: String,
    },
    /// The connection indicator changed.
    ConnectivityChanged {
        /// New indicator value.
        connected: bool,
    },
}

enum Beat {
    Wrote,
    /// Read only: invalidated, and the record does not name a foreign owner yet.
    Observed,
    Foreign(String),
}

/// Builder for a per-session heartbeat.
///
/// Call [`spawn`](Self::spawn) to start the background task.
pub struct HeartbeatMonitor {
    session_id: String,
    remote: Arc<dyn RecordStore>,
    ownership: Arc<OwnershipState>,
    interval: Duration,
    failure_threshold: u32,
    timeouts: TimeoutConfig,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Construct a monitor (does not start beating yet).
    #[must_use]
    pub fn new(
        session_id: String,
        remote: Arc<dyn RecordStore>,
        ownership: Arc<OwnershipState>,
        config: &HeartbeatConfig,
        timeouts: TimeoutConfig,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            remote,
            ownership,
            interval: Duration::from_millis(config.interval_ms),
            failure_threshold: config.failure_threshold,
            timeouts,
            event_tx,
            cancel,
        }
    }

    /// Spawn the heartbeat loop. The first beat is immediate.
    #[must_use]
    pub fn spawn(self) -> HeartbeatHandle {
        let beat_now = Arc::new(Notify::new());
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = self.cancel.clone();

        let join_handle = tokio::spawn(
            self.run(Arc::clone(&beat_now), Arc::clone(&connected))
                .instrument(info_span!("heartbeat")),
        );

        HeartbeatHandle {
            beat_now,
            connected,
            cancel,
            join_handle: Some(join_handle),
        }
    }

    async fn run(self, beat_now: Arc<Notify>, connected: Arc<AtomicBool>) {
        let session_id = self.session_id.clone();
        let mut failures: u32 = 0;

        loop {
            if self.ownership.is_taken_over() {
                debug!(session_id, "heartbeat paused until control is taken back");
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    () = self.ownership.reclaimed() => continue,
                }
            }

            match self.beat().await {
                Ok(Beat::Wrote | Beat::Observed) => {
                    failures = 0;
                    self.set_connected(&connected, true).await;
                }
                Ok(Beat::Foreign(foreign_token)) => {
                    failures = 0;
                    self.set_connected(&connected, true).await;
                    if self.ownership.mark_taken_over() {
                        info!(session_id, %foreign_token, "session taken over by another instance");
                        let _ = self
                            .event_tx
                            .send(HeartbeatEvent::TakenOver { foreign_token })
                            .await;
                    }
                    continue;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(session_id, failures, %err, "heartbeat failed");
                    if failures >= self.failure_threshold {
                        self.set_connected(&connected, false).await;
                    }
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(session_id, "heartbeat cancelled");
                    return;
                }
                () = tokio::time::sleep(self.interval) => {}
                () = beat_now.notified() => {}
            }
        }
    }

    async fn beat(&self) -> Result<Beat> {
        let doc = with_budget(
            self.timeouts.read(),
            "heartbeat read",
            self.remote.get(&self.session_id),
        )
        .await?;

        let current = doc
            .as_ref()
            .and_then(|doc| doc.get("ownership_token"))
            .and_then(Value::as_str);

        if let Some(current) = current {
            if current != self.ownership.token() && !self.ownership.may_displace(current) {
                return Ok(Beat::Foreign(current.to_owned()));
            }
        }

        if self.ownership.is_invalidated() {
            return Ok(Beat::Observed);
        }

        with_budget(
            self.timeouts.write(),
            "heartbeat write",
            self.remote.update(
                &self.session_id,
                vec![
                    FieldWrite::server_timestamp("last_heartbeat"),
                    FieldWrite::value("ownership_token", self.ownership.token().into()),
                ],
            ),
        )
        .await?;

        if !self.ownership.is_claimed() {
            self.ownership.complete_claim();
            info!(session_id = %self.session_id, "ownership claim completed by heartbeat");
        }
        Ok(Beat::Wrote)
    }

    async fn set_connected(&self, connected: &AtomicBool, value: bool) {
        if connected.swap(value, Ordering::SeqCst) != value {
            info!(session_id = %self.session_id, connected = value, "connection indicator changed");
            let _ = self
                .event_tx
                .send(HeartbeatEvent::ConnectivityChanged { connected: value })
                .await;
        }
    }
}

/// Handle returned from [`HeartbeatMonitor::spawn`].
pub struct HeartbeatHandle {
    beat_now: Arc<Notify>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl Drop for HeartbeatHandle {
    /// Cancel the background task when the handle is dropped.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl HeartbeatHandle {
    /// Beat immediately instead of waiting for the interval (page became visible).
    pub fn beat_now(&self) {
        self.beat_now.notify_one();
    }

    /// Current connection indicator.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop the heartbeat and wait for it to exit.
    pub async fn await_completion(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}
