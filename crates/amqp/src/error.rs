//! Error types for the broker client.
//!
//! Two layers of errors exist:
//!
//! - [`TransportError`] is what the broker transport reports: dial failures,
//!   closed connections or sessions, refused declarations, timeouts. It is
//!   `Clone` so that the same failure can be attached to a closure signal and
//!   logged by several observers.
//! - [`ClientError`] is what callers of [`crate::Client`] see.
//!
//! # Propagation
//!
//! Transport failures during connect, session initialisation and publishing are
//! retried inside the supervisor that owns them. Callers of `push` only ever
//! observe [`ClientError::Shutdown`]. Handler failures inside the consumer loop
//! are turned into a reject/requeue decision and never leave the loop.
//!
//! ```ignore
//! match client.push("orders.created", body).await {
//!     Ok(()) => {}
//!     // The only terminal outcome of push
//!     Err(ClientError::Shutdown) => return,
//!     Err(e) => unreachable!("push retries everything else: {e}"),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Failures reported by the broker transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker could not be reached or refused the connection.
    #[error("Connect error: {0}")]
    Connect(String),

    /// The connection or session was closed before or during the call.
    #[error("Closed: {0}")]
    Closed(String),

    /// The broker refused a declaration (e.g. incompatible queue arguments).
    ///
    /// Brokers close the session that issued the failing declaration.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A deadline elapsed before the call completed.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Any other protocol-level or I/O failure.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// The error type returned by [`crate::Client`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The operation needs a Ready session and there is none right now.
    #[error("not connected to a server")]
    NotConnected,

    /// `close` was called while the client was no longer Ready.
    #[error("already closed: not connected to the server")]
    AlreadyClosed,

    /// The operation was aborted because the client is shutting down.
    #[error("client is shutting down")]
    Shutdown,

    /// Wraps an underlying transport or network failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A consumer handler returned an error.
    ///
    /// Never fatal for the client; the consumer loop converts it into a
    /// reject decision.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Client configuration failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),
}

impl ClientError {
    /// Returns true for the terminal shutdown outcome.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ClientError::Shutdown)
    }
}
