//! Broker transport abstraction.
//!
//! The client never speaks the wire protocol itself. It drives an opaque
//! transport through three traits:
//!
//! ```text
//! Transport ──dial──> Connection ──open_session──> Session
//!                         │                          │
//!                    closed(): ClosureSignal    closed(): ClosureSignal
//!                                               confirmations(): ConfirmationStream
//!                                               consume(): DeliveryStream
//! ```
//!
//! Implementations:
//! - [`lapin::LapinTransport`] (feature `amqp`): RabbitMQ via `lapin`.
//! - [`memory::MemoryBroker`]: an in-process broker for tests and local runs.
//!
//! Every connection and session hands out a fresh [`ClosureSignal`] that fires
//! exactly once when it terminates, whoever closed it.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::{error::TransportError, signal::ClosureSignal};

#[cfg(feature = "amqp")]
pub mod lapin;
#[cfg(any(test, feature = "memory"))]
pub mod memory;

/// Delivery mode marking a message as persistent.
pub const PERSISTENT: u8 = 2;

/// Entry point of a transport: establishes connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Opens a new working session (AMQP channel) on this connection.
    async fn open_session(&self) -> Result<Arc<dyn Session>, TransportError>;

    /// Signal fired once when this connection terminates.
    fn closed(&self) -> ClosureSignal;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A working session multiplexed over one connection.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Switches the session into publisher confirmation mode.
    async fn enable_confirm(&self) -> Result<(), TransportError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<(), TransportError>;

    async fn bind(&self, queue: &str, routing_key: &str, exchange: &str)
        -> Result<(), TransportError>;

    /// Hands a message to the broker. Completion does not imply confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        message: OutboundMessage,
    ) -> Result<(), TransportError>;

    /// Takes the confirmation stream of this session.
    ///
    /// Confirmations arrive in publish order. The stream can be taken once;
    /// later calls return `None`.
    fn confirmations(&self) -> Option<ConfirmationStream>;

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Starts consuming `queue`. With `manual_ack` every delivery stays owned
    /// by the broker until acked or rejected.
    async fn consume(
        &self,
        queue: &str,
        manual_ack: bool,
        exclusive: bool,
    ) -> Result<DeliveryStream, TransportError>;

    /// Signal fired once when this session terminates.
    fn closed(&self) -> ClosureSignal;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Acknowledgement handle of a single delivery.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self, multiple: bool) -> Result<(), TransportError>;
    async fn reject(&self, multiple: bool, requeue: bool) -> Result<(), TransportError>;
}

/// Inbound messages of one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Ordered publisher confirmations of one session.
pub type ConfirmationStream = mpsc::UnboundedReceiver<Confirmation>;

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueOptions {
    /// Durable, shared, never auto-deleted.
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }
}

/// The subset of queue arguments the client uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-dead-letter-exchange` (the default exchange is `""`).
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`.
    pub dead_letter_routing_key: Option<String>,
}

impl QueueArguments {
    pub fn is_empty(&self) -> bool {
        self.dead_letter_exchange.is_none() && self.dead_letter_routing_key.is_none()
    }
}

/// Publish flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishFlags {
    pub mandatory: bool,
    pub immediate: bool,
}

/// Message handed to [`Session::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Bytes,
    pub content_type: String,
    pub delivery_mode: u8,
}

impl OutboundMessage {
    /// Persistent `text/plain` message.
    pub fn persistent(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: "text/plain".to_string(),
            delivery_mode: PERSISTENT,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == PERSISTENT
    }
}

/// Broker confirmation of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack(u64),
    Nack(u64),
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Confirmation::Ack(_))
    }

    pub fn delivery_tag(&self) -> u64 {
        match self {
            Confirmation::Ack(tag) | Confirmation::Nack(tag) => *tag,
        }
    }
}

/// One inbound message, owned by the broker until acked or rejected.
#[derive(Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub exchange: String,
    pub body: Bytes,
    pub redelivered: bool,
    pub delivery_tag: u64,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        exchange: impl Into<String>,
        body: impl Into<Bytes>,
        redelivered: bool,
        delivery_tag: u64,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            exchange: exchange.into(),
            body: body.into(),
            redelivered,
            delivery_tag,
            acker,
        }
    }

    /// Acknowledges this delivery.
    pub async fn ack(&self, multiple: bool) -> Result<(), TransportError> {
        self.acker.ack(multiple).await
    }

    /// Rejects this delivery, optionally putting it back on the queue.
    pub async fn reject(&self, multiple: bool, requeue: bool) -> Result<(), TransportError> {
        self.acker.reject(multiple, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("exchange", &self.exchange)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}
