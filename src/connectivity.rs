//! Online/offline signal consumed by the flush scheduler and the controller.

use tokio::sync::watch;

/// Source of truth for whether the process believes it is online.
///
/// The embedding layer flips it (browser `online`/`offline` events, a CLI
/// command, a test); consumers react to transitions through [`subscribe`](Self::subscribe).
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    /// Create a signal with an initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Update the state; subscribers are woken only on an actual change.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    /// Current state.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver notified on every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
