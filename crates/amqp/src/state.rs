//! Client state shared between the supervisors and the public handle.
//!
//! The current connection, the current session and the lifecycle state live in
//! `watch` channels. Each one has exactly one writer:
//!
//! | Value             | Writer                                    |
//! |-------------------|-------------------------------------------|
//! | connection handle | connection supervisor                     |
//! | session handle    | session supervisor (set Ready, withdraw)  |
//! | [`ClientState`]   | whichever of the two owns the transition  |
//!
//! The session supervisor withdraws its session before it returns, on
//! session loss, connection loss and shutdown alike.
//!
//! Readers take a snapshot (`borrow().clone()`) and never keep the borrow
//! across an `.await`.
//!
//! # Examples
//!
//! ```ignore
//! let mut state_rx = client.subscribe_state();
//! while state_rx.changed().await.is_ok() {
//!     println!("Broker client: {}", *state_rx.borrow());
//! }
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::{
    config::Timings,
    error::TransportError,
    signal::{ClosureSignal, Shutdown},
    topology::Topology,
    transport::{ConfirmationStream, Connection, Session},
};

/// Lifecycle state of a client.
///
/// ```text
/// Connecting ─> Connected ─> Ready ─┬─> Connected (session lost, re-init)
///     ^                             └─> Disconnected ─> Reconnecting ─┐
///     └───────────────────────────────────────────────────────────────┘
/// any ─> Closed (shutdown)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ClientState {
    /// Dialing the broker.
    Connecting,

    /// Connection established, session not (yet) initialised.
    Connected,

    /// Session open, confirm mode enabled and topology declared.
    ///
    /// The only state in which publishing and consuming succeed.
    Ready,

    /// Waiting the fixed reconnect delay; the value is the delay in seconds.
    Reconnecting(f64),

    /// Connection lost; the value is the reason.
    Disconnected(String),

    /// Shutdown completed. Terminal.
    Closed,
}

impl ClientState {
    /// Short identifier of the state, without details.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Connecting => "Connecting",
            ClientState::Connected => "Connected",
            ClientState::Ready => "Ready",
            ClientState::Reconnecting(_) => "Reconnecting",
            ClientState::Disconnected(_) => "Disconnected",
            ClientState::Closed => "Closed",
        }
    }

    /// Contextual details: the disconnect reason or the pending delay.
    pub fn details(&self) -> String {
        match self {
            ClientState::Disconnected(reason) => reason.clone(),
            ClientState::Reconnecting(seconds) => format!("in {seconds} seconds"),
            _ => String::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ClientState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ClientState::Closed)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// The live connection together with its closure signal.
pub(crate) struct ConnectionHandle {
    connection: Arc<dyn Connection>,
    closed: ClosureSignal,
    released: AtomicBool,
}

impl ConnectionHandle {
    pub(crate) fn new(connection: Arc<dyn Connection>) -> Self {
        let closed = connection.closed();
        Self {
            connection,
            closed,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub(crate) fn closed(&self) -> &ClosureSignal {
        &self.closed
    }

    /// Closes the connection once. Later calls are no-ops.
    pub(crate) async fn release(&self) -> Result<(), TransportError> {
        if self.released.swap(true, Ordering::AcqRel) || self.closed.is_fired() {
            return Ok(());
        }
        self.connection.close().await
    }
}

/// The live session, its confirmation slot and its closure signal.
pub(crate) struct SessionHandle {
    session: Arc<dyn Session>,
    confirms: Mutex<ConfirmationStream>,
    closed: ClosureSignal,
    released: AtomicBool,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<dyn Session>, confirms: ConfirmationStream) -> Self {
        let closed = session.closed();
        Self {
            session,
            confirms: Mutex::new(confirms),
            closed,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// The single, order-preserving confirmation slot of this session.
    pub(crate) fn confirms(&self) -> &Mutex<ConfirmationStream> {
        &self.confirms
    }

    pub(crate) fn closed(&self) -> &ClosureSignal {
        &self.closed
    }

    /// Closes the session once. Later calls are no-ops.
    pub(crate) async fn release(&self) -> Result<(), TransportError> {
        if self.released.swap(true, Ordering::AcqRel) || self.closed.is_fired() {
            return Ok(());
        }
        self.session.close().await
    }
}

/// Everything the supervisors, publisher and consumer loop share.
pub(crate) struct Shared {
    pub(crate) topology: Topology,
    pub(crate) timings: Timings,
    pub(crate) shutdown: Shutdown,
    state: watch::Sender<ClientState>,
    connection: watch::Sender<Option<Arc<ConnectionHandle>>>,
    session: watch::Sender<Option<Arc<SessionHandle>>>,
}

impl Shared {
    pub(crate) fn new(topology: Topology, timings: Timings, shutdown: Shutdown) -> Self {
        Self {
            topology,
            timings,
            shutdown,
            state: watch::Sender::new(ClientState::Connecting),
            connection: watch::Sender::new(None),
            session: watch::Sender::new(None),
        }
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub(crate) fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    /// Broadcasts `state` if it differs from the current one.
    pub(crate) fn set_state(&self, state: ClientState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state || current.is_closed() {
                return false;
            }
            *current = state.clone();
            true
        });
        if changed {
            info!("Broker client state changed to: {}", state);
        }
    }

    /// Marks the client closed. Terminal, not reversible by any later update.
    pub(crate) fn set_closed(&self) {
        if !self.state.borrow().is_closed() {
            self.state.send_replace(ClientState::Closed);
            info!("Broker client state changed to: {}", ClientState::Closed);
        }
    }

    /// Snapshot of the current connection.
    pub(crate) fn connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.connection.borrow().clone()
    }

    pub(crate) fn set_connection(&self, handle: Option<Arc<ConnectionHandle>>) {
        self.connection.send_replace(handle);
    }

    /// Snapshot of the current session. `Some` only while Ready.
    pub(crate) fn session(&self) -> Option<Arc<SessionHandle>> {
        self.session.borrow().clone()
    }

    /// Publishes a freshly initialised session and flips the client to Ready.
    pub(crate) fn set_ready(&self, handle: Arc<SessionHandle>) {
        self.session.send_replace(Some(handle));
        self.set_state(ClientState::Ready);
    }

    /// Withdraws the current session; the client stays Connected.
    pub(crate) fn clear_session(&self) -> Option<Arc<SessionHandle>> {
        let previous = self.session.send_replace(None);
        if previous.is_some() {
            debug!("Session withdrawn");
        }
        previous
    }

    /// Snapshot of the ready session, as long as the client is Ready.
    pub(crate) fn ready_session(&self) -> Option<Arc<SessionHandle>> {
        if !self.state.borrow().is_ready() {
            return None;
        }
        self.session()
    }

    /// Resolves once the client is Ready, or returns `false` once it is Closed.
    pub(crate) async fn wait_ready(&self) -> bool {
        let mut rx = self.state.subscribe();
        let state = rx.wait_for(|s| s.is_ready() || s.is_closed()).await;
        state.map_or(false, |s| s.is_ready())
    }
}
