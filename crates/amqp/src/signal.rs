//! Single-fire notifications built on [`CancellationToken`].
//!
//! - [`ClosureSignal`] is raised exactly once when a connection or session
//!   terminates. Every new connection or session gets a fresh one; old signals
//!   are dropped together with the handle they belonged to and never re-armed.
//! - [`Shutdown`] is the client-wide broadcast-once stop request. Every
//!   blocking wait in the client selects on it.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use tokio_util::sync::CancellationToken;

/// Notification raised once when a connection or session goes away.
///
/// Clones observe the same signal. The first call to [`ClosureSignal::fire`]
/// records the reason and wakes every waiter; later calls are ignored.
#[derive(Debug, Clone, Default)]
pub struct ClosureSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl ClosureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub fn fire(&self, reason: impl Into<String>) -> bool {
        if self.reason.set(reason.into()).is_err() {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the signal fires and returns the recorded reason.
    pub async fn fired(&self) -> String {
        self.token.cancelled().await;
        self.reason().unwrap_or_default()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }
}

/// Broadcast-once shutdown request shared by every task of a client.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a shutdown that also fires when `parent` is cancelled.
    ///
    /// Used to tie the client to an application-wide token.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests shutdown. Returns `true` for the first caller only.
    pub fn trigger(&self) -> bool {
        let first = !self.fired.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Exposes the underlying token for integration with other components.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
