//! Session-scoped, best-effort publish/subscribe between sibling instances.
//!
//! Messages only reach instances subscribed at the moment of publishing;
//! there is no persistence and no delivery guarantee. Instances that share
//! nothing but the remote record rely on the heartbeat instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

/// Message exchanged between instances of one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimMessage {
    /// An instance is claiming ownership of the session.
    SessionClaimed {
        /// Claiming instance's identity token.
        token: String,
    },
}

/// Cross-instance channel for one session.
pub trait InstanceChannel: Send + Sync {
    /// Send to every current subscriber (including the sender's own subscription).
    fn publish(&self, message: ClaimMessage);

    /// Subscribe to messages published from now on.
    fn subscribe(&self) -> broadcast::Receiver<ClaimMessage>;
}

/// Registry of in-process session channels, standing in for a same-origin
/// broadcast facility.
#[derive(Debug, Clone, Default)]
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<ClaimMessage>>>>,
}

impl ChannelHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel scoped to `session_id`; every call for the same id shares it.
    #[must_use]
    pub fn channel(&self, session_id: &str) -> SessionChannel {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sender = channels
            .entry(session_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        SessionChannel {
            session_id: session_id.to_owned(),
            sender,
        }
    }
}

/// One session's channel handle.
#[derive(Debug, Clone)]
pub struct SessionChannel {
    session_id: String,
    sender: broadcast::Sender<ClaimMessage>,
}

impl InstanceChannel for SessionChannel {
    fn publish(&self, message: ClaimMessage) {
        // No subscribers is not an error for a best-effort channel.
        if let Err(err) = self.sender.send(message) {
            debug!(session_id = %self.session_id, ?err, "claim message had no listeners");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ClaimMessage> {
        self.sender.subscribe()
    }
}
