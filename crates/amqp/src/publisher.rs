//! Confirmed publishing.
//!
//! [`Publisher::push`] keeps trying until the broker positively confirms the
//! message or the client shuts down:
//!
//! ```text
//! ┌─> publish ──failed──> wait resend delay ──┐
//! │      │                                    │
//! │      └─ok─> await confirmation ──nack──┐  │
//! │                   │                    │  │
//! │                  ack ──> Ok            │  │
//! └────────────────────────────────────────┴──┘
//! ```
//!
//! Confirmations of a session arrive in publish order on one stream. `push`
//! holds that stream for a whole publish/confirm cycle, so pushes on one
//! client are serialised and each one reads the confirmation of its own
//! publish. Confirmations left over from earlier [`Publisher::unsafe_push`]
//! calls are discarded before publishing.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    error::{ClientError, TransportError},
    state::{SessionHandle, Shared},
    transport::{OutboundMessage, PublishFlags},
};

/// Publishes to the topology's exchange on the current Ready session.
#[derive(Clone)]
pub(crate) struct Publisher {
    shared: Arc<Shared>,
}

impl Publisher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Publishes `body` and blocks until the broker confirms it.
    ///
    /// # Returns
    /// - `Ok(())`: the broker positively confirmed exactly this publish
    /// - `Err(ClientError::Shutdown)`: shutdown was requested while waiting
    pub(crate) async fn push(&self, routing_key: &str, body: Bytes) -> Result<(), ClientError> {
        let shutdown = &self.shared.shutdown;

        loop {
            if shutdown.is_triggered() {
                return Err(ClientError::Shutdown);
            }

            let session = match self.ready() {
                Ok(session) => session,
                Err(e) => {
                    self.resend_wait(&e).await?;
                    continue;
                }
            };

            let mut confirms = tokio::select! {
                biased;
                _ = shutdown.wait() => return Err(ClientError::Shutdown),
                guard = session.confirms().lock() => guard,
            };
            while let Ok(stale) = confirms.try_recv() {
                debug!("Discarding stale confirmation {}", stale.delivery_tag());
            }

            if let Err(e) = self.publish(&session, routing_key, body.clone()).await {
                drop(confirms);
                self.resend_wait(&e).await?;
                continue;
            }

            let confirmation = tokio::select! {
                biased;
                _ = shutdown.wait() => return Err(ClientError::Shutdown),
                confirmation = confirms.recv() => confirmation,
            };
            match confirmation {
                Some(c) if c.is_ack() => {
                    trace!("Publish to '{}' confirmed (tag {})", routing_key, c.delivery_tag());
                    return Ok(());
                }
                Some(c) => {
                    warn!(
                        "Publish to '{}' negatively confirmed (tag {}). Retrying",
                        routing_key,
                        c.delivery_tag()
                    );
                }
                None => {
                    warn!("Session closed before publish to '{}' was confirmed. Retrying", routing_key);
                }
            }
        }
    }

    /// Publishes `body` once, without waiting for a confirmation.
    ///
    /// Fails with [`ClientError::NotConnected`] unless the client is Ready.
    pub(crate) async fn unsafe_push(&self, routing_key: &str, body: Bytes) -> Result<(), ClientError> {
        let session = self.ready()?;
        self.publish(&session, routing_key, body).await
    }

    fn ready(&self) -> Result<Arc<SessionHandle>, ClientError> {
        self.shared.ready_session().ok_or(ClientError::NotConnected)
    }

    /// Persistent publish bounded by the publish deadline. The deadline covers
    /// the publish call only, not the confirmation.
    async fn publish(
        &self,
        session: &SessionHandle,
        routing_key: &str,
        body: Bytes,
    ) -> Result<(), ClientError> {
        let deadline = self.shared.timings.publish_timeout;
        let exchange = self.shared.topology.exchange();
        let publish = session.session().publish(
            exchange,
            routing_key,
            PublishFlags::default(),
            OutboundMessage::persistent(body),
        );

        tokio::time::timeout(deadline, publish)
            .await
            .map_err(|_| TransportError::Timeout(deadline))??;
        Ok(())
    }

    async fn resend_wait(&self, cause: &ClientError) -> Result<(), ClientError> {
        let delay = self.shared.timings.resend;
        warn!(
            "Push failed: {}. Retrying in {:.2} seconds",
            cause,
            delay.as_secs_f64()
        );
        tokio::select! {
            biased;
            _ = self.shared.shutdown.wait() => Err(ClientError::Shutdown),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
