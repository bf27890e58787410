//! Session lifecycle state shared between the session tasks.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;

/// `Unregistered → Registering → Active → Disconnecting → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registering,
    Active,
    Disconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unregistered => "unregistered",
            SessionState::Registering => "registering",
            SessionState::Active => "active",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared handle to the lifecycle state.
pub type SharedState = Arc<SessionShared>;

/// Flags and bookkeeping read across tasks.
///
/// The receive task owns transitions after `Active`; the keep-alive ticker is
/// the only writer of the keep-alive fields. `running` is cleared by whoever
/// asks the session to stop.
#[derive(Debug)]
pub struct SessionShared {
    running: AtomicBool,
    state_tx: watch::Sender<SessionState>,
    last_keepalive_sent: Mutex<Option<Instant>>,
    keepalives_sent: AtomicU64,
}

impl SessionShared {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Unregistered);
        Self {
            running: AtomicBool::new(false),
            state_tx,
            last_keepalive_sent: Mutex::new(None),
            keepalives_sent: AtomicU64::new(0),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(Self::new())
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "session state");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn record_keepalive(&self, at: Instant) {
        *self
            .last_keepalive_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(at);
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_keepalive_sent(&self) -> Option<Instant> {
        *self
            .last_keepalive_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn keepalives_sent(&self) -> u64 {
        self.keepalives_sent.load(Ordering::Relaxed)
    }
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}
