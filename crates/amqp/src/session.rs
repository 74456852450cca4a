//! Session supervision.
//!
//! Owns the single working session on a live connection. Each round:
//!
//! 1. open a session, enable publisher confirms, take the confirmation stream
//! 2. declare the topology (dead-letter queue, queue, bindings)
//! 3. publish the session and flip the client to Ready
//! 4. wait for shutdown, connection loss or session loss
//!
//! A lost session is re-initialised on the same connection; a lost connection
//! is reported upward. A session can die on its own (for example after an
//! inequivalent queue redeclaration) while the connection stays up, so the
//! narrower scope is always retried first.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    state::{ClientState, ConnectionHandle, SessionHandle, Shared},
    transport::{ConfirmationStream, Session},
};

/// Why a session supervisor stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionOutcome {
    /// The connection closed; the value is the reason.
    ConnectionLost(String),
    /// Shutdown was requested.
    Shutdown,
}

pub(crate) struct SessionSupervisor {
    shared: Arc<Shared>,
    connection: Arc<ConnectionHandle>,
}

impl SessionSupervisor {
    pub(crate) fn new(shared: Arc<Shared>, connection: Arc<ConnectionHandle>) -> Self {
        Self { shared, connection }
    }

    /// Runs the recovery loop on its own task.
    pub(crate) fn spawn(self) -> JoinHandle<SessionOutcome> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> SessionOutcome {
        let shutdown = self.shared.shutdown.clone();
        let connection_closed = self.connection.closed().clone();
        let reinit_delay = self.shared.timings.reinit;

        loop {
            let initialised = tokio::select! {
                biased;
                _ = shutdown.wait() => return SessionOutcome::Shutdown,
                reason = connection_closed.fired() => return SessionOutcome::ConnectionLost(reason),
                result = self.init() => result,
            };

            let handle = match initialised {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(
                        "Failed to initialise session: {}. Retrying in {:.2} seconds",
                        e,
                        reinit_delay.as_secs_f64()
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => return SessionOutcome::Shutdown,
                        reason = connection_closed.fired() => return SessionOutcome::ConnectionLost(reason),
                        _ = tokio::time::sleep(reinit_delay) => continue,
                    }
                }
            };

            let session_closed = handle.closed().clone();
            self.shared.set_ready(handle);
            info!(
                "Session ready: queue '{}' bound to {} routing key(s) on '{}'",
                self.shared.topology.queue(),
                self.shared.topology.routing_keys().len(),
                self.shared.topology.exchange()
            );

            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    self.withdraw().await;
                    return SessionOutcome::Shutdown;
                }
                reason = connection_closed.fired() => {
                    self.withdraw().await;
                    return SessionOutcome::ConnectionLost(reason);
                }
                reason = session_closed.fired() => {
                    warn!("Session closed: {}. Re-initialising", reason);
                    self.withdraw().await;
                    self.shared.set_state(ClientState::Connected);
                }
            }
        }
    }

    /// Opens and prepares a new session. A half-prepared session is closed
    /// before the error is returned.
    async fn init(&self) -> Result<Arc<SessionHandle>, TransportError> {
        let session = self.connection.connection().open_session().await?;
        match self.prepare(&session).await {
            Ok(confirms) => Ok(Arc::new(SessionHandle::new(session, confirms))),
            Err(e) => {
                if !session.closed().is_fired() {
                    if let Err(close_err) = session.close().await {
                        debug!("Failed to close half-initialised session: {}", close_err);
                    }
                }
                Err(e)
            }
        }
    }

    async fn prepare(&self, session: &Arc<dyn Session>) -> Result<ConfirmationStream, TransportError> {
        session.enable_confirm().await?;
        let confirms = session.confirmations().ok_or_else(|| {
            TransportError::Protocol("confirmation stream already taken".into())
        })?;
        self.shared.topology.declare(session.as_ref()).await?;
        Ok(confirms)
    }

    /// Takes the current session out of circulation and releases it. This is
    /// the only place a session handle is removed from the shared state.
    async fn withdraw(&self) {
        if let Some(handle) = self.shared.clear_session() {
            if let Err(e) = handle.release().await {
                debug!("Failed to close lost session: {}", e);
            }
        }
    }
}
