//! RabbitMQ transport backed by `lapin`.
//!
//! Maps the transport traits onto AMQP 0-9-1:
//!
//! | Trait call            | AMQP                                   |
//! |-----------------------|----------------------------------------|
//! | `dial`                | `connection.open`                      |
//! | `open_session`        | `channel.open`                         |
//! | `enable_confirm`      | `confirm.select`                       |
//! | `declare_queue`       | `queue.declare` (`x-dead-letter-*`)    |
//! | `bind`                | `queue.bind`                           |
//! | `publish`             | `basic.publish`                        |
//! | `set_prefetch`        | `basic.qos` (per consumer)             |
//! | `consume`             | `basic.consume`                        |
//!
//! Closure signals fire from lapin's error callbacks, or when the client
//! closes the connection or channel itself.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::StreamExt;
use ::lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::PublisherConfirm,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ConnectionProperties,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Acker, Confirmation, ConfirmationStream, Connection, Delivery, DeliveryStream,
    OutboundMessage, PublishFlags, QueueArguments, QueueOptions, Session, Transport,
};
use crate::{error::TransportError, signal::ClosureSignal};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ (or any AMQP 0-9-1 broker) with `lapin`.
#[derive(Clone, Default)]
pub struct LapinTransport {
    properties: ConnectionProperties,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses custom connection properties (executor, reactor, client name).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

fn map_error(err: lapin::Error) -> TransportError {
    match &err {
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            TransportError::Precondition(err.to_string())
        }
        lapin::Error::InvalidChannel(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError => TransportError::Closed(err.to_string()),
        _ => TransportError::Protocol(err.to_string()),
    }
}

fn queue_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(routing_key.as_str())),
        );
    }
    table
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let connection = lapin::Connection::connect(address, self.properties.clone())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let closed = ClosureSignal::new();
        let signal = closed.clone();
        connection.on_error(move |err| {
            warn!("Connection error: {}", err);
            signal.fire(err.to_string());
        });

        Ok(Arc::new(LapinConnection {
            connection,
            closed,
        }))
    }
}

struct LapinConnection {
    connection: lapin::Connection,
    closed: ClosureSignal,
}

#[async_trait]
impl Connection for LapinConnection {
    async fn open_session(&self) -> Result<Arc<dyn Session>, TransportError> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;

        let closed = ClosureSignal::new();
        let signal = closed.clone();
        let id = channel.id();
        channel.on_error(move |err| {
            warn!("Channel {} error: {}", id, err);
            signal.fire(err.to_string());
        });

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_confirmations(pending_rx, confirm_tx));

        Ok(Arc::new(LapinSession {
            channel,
            closed,
            confirm_mode: AtomicBool::new(false),
            publish_seq: AtomicU64::new(0),
            pending_tx,
            confirms: Mutex::new(Some(confirm_rx)),
        }))
    }

    fn closed(&self) -> ClosureSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self
            .connection
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(map_error);
        self.closed.fire("closed by client");
        result
    }
}

/// Resolves publisher confirms in publish order and hands them to the
/// session's confirmation stream.
async fn forward_confirmations(
    mut pending: mpsc::UnboundedReceiver<(u64, PublisherConfirm)>,
    confirms: mpsc::UnboundedSender<Confirmation>,
) {
    while let Some((seq, confirm)) = pending.recv().await {
        let confirmation = match confirm.await {
            Ok(c) if c.is_ack() => Confirmation::Ack(seq),
            Ok(_) => Confirmation::Nack(seq),
            Err(e) => {
                debug!("Confirmation {} lost: {}", seq, e);
                Confirmation::Nack(seq)
            }
        };
        if confirms.send(confirmation).is_err() {
            break;
        }
    }
}

struct LapinSession {
    channel: lapin::Channel,
    closed: ClosureSignal,
    confirm_mode: AtomicBool,
    publish_seq: AtomicU64,
    pending_tx: mpsc::UnboundedSender<(u64, PublisherConfirm)>,
    confirms: Mutex<Option<ConfirmationStream>>,
}

#[async_trait]
impl Session for LapinSession {
    async fn enable_confirm(&self) -> Result<(), TransportError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)?;
        self.confirm_mode.store(true, Ordering::Release);
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<(), TransportError> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        self.channel
            .queue_declare(name, options, queue_arguments(&arguments))
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        flags: PublishFlags,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(message.delivery_mode)
            .with_content_type(ShortString::from(message.content_type));
        let options = BasicPublishOptions {
            mandatory: flags.mandatory,
            immediate: flags.immediate,
        };

        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, &message.body, properties)
            .await
            .map_err(map_error)?;

        if self.confirm_mode.load(Ordering::Acquire) {
            let seq = self.publish_seq.fetch_add(1, Ordering::AcqRel) + 1;
            if self.pending_tx.send((seq, confirm)).is_err() {
                return Err(TransportError::Closed(
                    "confirmation forwarder stopped".into(),
                ));
            }
        }
        Ok(())
    }

    fn confirmations(&self) -> Option<ConfirmationStream> {
        self.confirms.lock().take()
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(map_error)
    }

    async fn consume(
        &self,
        queue: &str,
        manual_ack: bool,
        exclusive: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let tag = format!("warren-{}", uuid::Uuid::new_v4());
        let options = BasicConsumeOptions {
            no_local: false,
            no_ack: !manual_ack,
            exclusive,
            nowait: false,
        };
        let consumer = self
            .channel
            .basic_consume(queue, &tag, options, FieldTable::default())
            .await
            .map_err(map_error)?;
        debug!("Consuming '{}' as {}", queue, tag);

        let stream = consumer.map(|item| {
            item.map(|delivery| {
                Delivery::new(
                    delivery.routing_key.as_str(),
                    delivery.exchange.as_str(),
                    delivery.data,
                    delivery.redelivered,
                    delivery.delivery_tag,
                    Arc::new(LapinAcker(delivery.acker)),
                )
            })
            .map_err(map_error)
        });
        Ok(stream.boxed())
    }

    fn closed(&self) -> ClosureSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self
            .channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(map_error);
        self.closed.fire("closed by client");
        result
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions { multiple })
            .await
            .map_err(map_error)
    }

    async fn reject(&self, multiple: bool, requeue: bool) -> Result<(), TransportError> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(map_error)
    }
}
