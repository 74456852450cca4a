//! In-process broker implementing the transport traits.
//!
//! `MemoryBroker` models the parts of an AMQP 0-9-1 broker the client relies
//! on:
//!
//! - the default exchange (`""`, routes by queue name) and topic exchanges
//!   with `*` / `#` wildcards
//! - durable queues with dead-letter arguments; an inequivalent redeclaration
//!   fails with `PRECONDITION_FAILED` and closes the session
//! - manual acknowledgement, prefetch and the redelivered flag
//! - rejection without requeue dead-letters through the queue arguments,
//!   rewriting the routing key
//! - publisher confirms, in publish order
//! - closing a session or connection requeues its unacknowledged deliveries
//!
//! On top of that it records every accepted publish and offers fault injection
//! (unreachable broker, killed sessions and connections, negative
//! confirmations, failing declarations) for recovery tests.
//!
//! All operations complete synchronously under one lock; no broker state is
//! held across an `.await`.
//!
//! # Examples
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! let client = Client::open(Config::new("orders", "memory://", ["orders.*"]), broker.clone())?;
//! client.push("orders.created", "42").await?;
//! assert_eq!(broker.published().len(), 1);
//! ```

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{channel::mpsc as delivery_mpsc, StreamExt};
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, trace};

use super::{
    Acker, Confirmation, ConfirmationStream, Connection, Delivery, DeliveryStream,
    OutboundMessage, PublishFlags, QueueArguments, QueueOptions, Session, Transport,
};
use crate::{error::TransportError, signal::ClosureSignal};

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub persistent: bool,
    pub redelivered: bool,
}

/// A publish the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub persistent: bool,
    pub content_type: String,
    /// Queues the message was routed to.
    pub queues: Vec<String>,
}

/// Cheaply cloneable handle to one in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
}

struct Queue {
    options: QueueOptions,
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
}

struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

struct ConsumerEntry {
    queue: String,
    manual_ack: bool,
    tx: delivery_mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

struct SessionEntry {
    connection: u64,
    closed: ClosureSignal,
    confirm_tx: mpsc::UnboundedSender<Confirmation>,
    confirm_mode: bool,
    publish_seq: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    consumers: Vec<ConsumerEntry>,
}

struct BrokerState {
    unreachable: bool,
    dial_attempts: Vec<Instant>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    connections: HashMap<u64, ClosureSignal>,
    sessions: BTreeMap<u64, SessionEntry>,
    next_id: u64,
    nack_next: usize,
    fail_declares: usize,
    peak_unacked: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            unreachable: false,
            dial_attempts: Vec::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            published: Vec::new(),
            connections: HashMap::new(),
            sessions: BTreeMap::new(),
            next_id: 0,
            nack_next: 0,
            fail_declares: 0,
            peak_unacked: 0,
        }
    }
}

enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

/// Matches an AMQP topic binding pattern against a routing key.
///
/// `*` matches exactly one word, `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn walk(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| walk(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && walk(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && walk(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    walk(&pattern, &key)
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_session(&self, id: u64) -> Result<(), TransportError> {
        if self.sessions.contains_key(&id) {
            Ok(())
        } else {
            Err(TransportError::Closed(format!("channel {id} is closed")))
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && topic_matches(&binding.pattern, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    fn enqueue(&mut self, targets: &[String], message: &StoredMessage) {
        for name in targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(queue) = self.queues.get_mut(queue) {
            queue.ready.push_front(message);
        }
    }

    fn dead_letter(&mut self, queue: &str, message: StoredMessage) {
        let arguments = match self.queues.get(queue) {
            Some(q) if !q.arguments.is_empty() => q.arguments.clone(),
            _ => {
                debug!("Discarded rejected message from '{}'", queue);
                return;
            }
        };

        let exchange = arguments.dead_letter_exchange.unwrap_or_default();
        let routing_key = arguments
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        let targets = self.route(&exchange, &routing_key);
        debug!(
            "Dead-lettered message from '{}' to {:?} with key '{}'",
            queue, targets, routing_key
        );

        let message = StoredMessage {
            exchange,
            routing_key,
            redelivered: false,
            ..message
        };
        self.enqueue(&targets, &message);
    }

    fn close_session(&mut self, broker: &Weak<Inner>, id: u64, reason: &str) -> bool {
        let Some(session) = self.sessions.remove(&id) else {
            return false;
        };
        for (queue, message) in session.unacked.into_values().rev() {
            self.requeue(&queue, message);
        }
        // Dropping the consumers ends their delivery streams.
        drop(session.consumers);
        session.closed.fire(reason);
        debug!("Channel {} closed: {}", id, reason);
        self.dispatch(broker);
        true
    }

    fn close_connection(&mut self, broker: &Weak<Inner>, id: u64, reason: &str) -> bool {
        let sessions: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.connection == id)
            .map(|(sid, _)| *sid)
            .collect();
        for sid in sessions {
            self.close_session(broker, sid, reason);
        }
        match self.connections.remove(&id) {
            Some(closed) => {
                closed.fire(reason);
                debug!("Connection {} closed: {}", id, reason);
                true
            }
            None => false,
        }
    }

    /// Hands ready messages to consumers until prefetch limits or empty queues
    /// stop progress.
    fn dispatch(&mut self, broker: &Weak<Inner>) {
        let BrokerState {
            queues,
            sessions,
            peak_unacked,
            ..
        } = self;

        loop {
            let mut progressed = false;
            for (&session_id, session) in sessions.iter_mut() {
                let SessionEntry {
                    prefetch,
                    next_tag,
                    unacked,
                    consumers,
                    ..
                } = session;

                consumers.retain(|c| !c.tx.is_closed());
                for consumer in consumers.iter() {
                    let limited = *prefetch > 0 && unacked.len() >= usize::from(*prefetch);
                    if consumer.manual_ack && limited {
                        continue;
                    }
                    let Some(queue) = queues.get_mut(&consumer.queue) else {
                        continue;
                    };
                    let Some(message) = queue.ready.pop_front() else {
                        continue;
                    };

                    *next_tag += 1;
                    let tag = *next_tag;
                    let acker = Arc::new(MemoryAcker {
                        broker: broker.clone(),
                        session: session_id,
                        tag,
                    });
                    let delivery = Delivery::new(
                        message.routing_key.clone(),
                        message.exchange.clone(),
                        message.body.clone(),
                        message.redelivered,
                        tag,
                        acker,
                    );
                    if consumer.tx.unbounded_send(Ok(delivery)).is_err() {
                        queue.ready.push_front(message);
                        continue;
                    }
                    trace!("Delivered tag {} from '{}'", tag, consumer.queue);

                    if consumer.manual_ack {
                        unacked.insert(tag, (consumer.queue.clone(), message));
                        *peak_unacked = (*peak_unacked).max(unacked.len());
                    }
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn settle(
        &mut self,
        broker: &Weak<Inner>,
        session_id: u64,
        tag: u64,
        multiple: bool,
        outcome: Settle,
    ) -> Result<(), TransportError> {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return Err(TransportError::Closed(format!(
                "channel {session_id} is closed"
            )));
        };

        if !session.unacked.contains_key(&tag) {
            let err = TransportError::Precondition(format!(
                "PRECONDITION_FAILED - unknown delivery tag {tag}"
            ));
            self.close_session(broker, session_id, &err.to_string());
            return Err(err);
        }

        let tags: Vec<u64> = if multiple {
            session.unacked.range(..=tag).map(|(t, _)| *t).collect()
        } else {
            vec![tag]
        };
        let mut settled = Vec::with_capacity(tags.len());
        for t in tags {
            if let Some(entry) = session.unacked.remove(&t) {
                settled.push(entry);
            }
        }

        // Reverse order keeps the original queue order on requeue.
        for (queue, message) in settled.into_iter().rev() {
            match outcome {
                Settle::Ack => {}
                Settle::Requeue => self.requeue(&queue, message),
                Settle::DeadLetter => self.dead_letter(&queue, message),
            }
        }
        self.dispatch(broker);
        Ok(())
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    /// Makes subsequent dials succeed or fail. Live connections are untouched.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.state.lock().unreachable = !reachable;
    }

    /// Instants of every dial attempt, successful or not.
    pub fn dial_attempts(&self) -> Vec<Instant> {
        self.inner.state.lock().dial_attempts.clone()
    }

    /// Force-closes every open session, as a broker-side channel error would.
    pub fn kill_sessions(&self) -> usize {
        let weak = self.weak();
        let mut state = self.inner.state.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        ids.into_iter()
            .filter(|id| state.close_session(&weak, *id, "CHANNEL_ERROR - killed by broker"))
            .count()
    }

    /// Force-closes every open connection.
    pub fn kill_connections(&self) -> usize {
        let weak = self.weak();
        let mut state = self.inner.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        ids.into_iter()
            .filter(|id| state.close_connection(&weak, *id, "CONNECTION_FORCED - broker forced connection closure"))
            .count()
    }

    /// Simulates a broker restart: all connections drop, non-durable queues and
    /// transient messages are lost.
    pub fn restart(&self) {
        self.kill_connections();
        let mut state = self.inner.state.lock();
        state.queues.retain(|_, q| q.options.durable);
        for queue in state.queues.values_mut() {
            queue.ready.retain(|m| m.persistent);
        }
        let BrokerState {
            queues, bindings, ..
        } = &mut *state;
        bindings.retain(|b| queues.contains_key(&b.queue));
    }

    /// Answers the next `count` confirm-mode publishes with a negative
    /// confirmation and drops those messages.
    pub fn nack_next_publishes(&self, count: usize) {
        self.inner.state.lock().nack_next = count;
    }

    /// Fails the next `count` queue declarations with `PRECONDITION_FAILED`.
    pub fn fail_next_declares(&self, count: usize) {
        self.inner.state.lock().fail_declares = count;
    }

    /// Publishes from outside any client session. Returns the number of
    /// queues the message reached.
    pub fn inject(&self, exchange: &str, routing_key: &str, body: impl Into<Bytes>) -> usize {
        let weak = self.weak();
        let mut state = self.inner.state.lock();
        let targets = state.route(exchange, routing_key);
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.into(),
            persistent: true,
            redelivered: false,
        };
        state.enqueue(&targets, &message);
        state.dispatch(&weak);
        targets.len()
    }

    /// Every publish accepted from a client session, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().published.clone()
    }

    /// Messages waiting in `queue` (not delivered, or requeued).
    pub fn messages(&self, queue: &str) -> Option<Vec<StoredMessage>> {
        let state = self.inner.state.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
    }

    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.inner.state.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Declaration flags and arguments of `queue`, if it exists.
    pub fn queue_declaration(&self, queue: &str) -> Option<(QueueOptions, QueueArguments)> {
        let state = self.inner.state.lock();
        state
            .queues
            .get(queue)
            .map(|q| (q.options, q.arguments.clone()))
    }

    /// `(exchange, pattern)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        let state = self.inner.state.lock();
        state
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.pattern.clone()))
            .collect()
    }

    /// Deliveries currently awaiting acknowledgement, across all sessions.
    pub fn unacked(&self) -> usize {
        let state = self.inner.state.lock();
        state.sessions.values().map(|s| s.unacked.len()).sum()
    }

    /// Highest number of unacknowledged deliveries any session ever held.
    pub fn peak_unacked(&self) -> usize {
        self.inner.state.lock().peak_unacked
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut state = self.inner.state.lock();
        state.dial_attempts.push(Instant::now());
        if state.unreachable {
            return Err(TransportError::Connect(format!(
                "{address}: connection refused"
            )));
        }

        let id = state.next_id();
        let closed = ClosureSignal::new();
        state.connections.insert(id, closed.clone());
        debug!("Accepted connection {} for {}", id, address);

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.inner.clone(),
            closed,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: Arc<Inner>,
    closed: ClosureSignal,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_session(&self) -> Result<Arc<dyn Session>, TransportError> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::Closed(format!(
                "connection {} is closed",
                self.id
            )));
        }

        let id = state.next_id();
        let closed = ClosureSignal::new();
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            SessionEntry {
                connection: self.id,
                closed: closed.clone(),
                confirm_tx,
                confirm_mode: false,
                publish_seq: 0,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                consumers: Vec::new(),
            },
        );

        Ok(Arc::new(MemorySession {
            id,
            broker: self.broker.clone(),
            closed,
            confirms: Mutex::new(Some(confirm_rx)),
        }))
    }

    fn closed(&self) -> ClosureSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let weak = Arc::downgrade(&self.broker);
        let mut state = self.broker.state.lock();
        if state.close_connection(&weak, self.id, "closed by client") {
            Ok(())
        } else {
            Err(TransportError::Closed(format!(
                "connection {} is already closed",
                self.id
            )))
        }
    }
}

struct MemorySession {
    id: u64,
    broker: Arc<Inner>,
    closed: ClosureSignal,
    confirms: Mutex<Option<ConfirmationStream>>,
}

impl MemorySession {
    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.broker)
    }

    /// Fails the call and closes the session, as a channel-level error does.
    fn channel_error(&self, state: &mut BrokerState, err: TransportError) -> TransportError {
        state.close_session(&self.weak(), self.id, &err.to_string());
        err
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn enable_confirm(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_session(self.id)?;
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.confirm_mode = true;
        }
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: QueueArguments,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_session(self.id)?;

        if state.fail_declares > 0 {
            state.fail_declares -= 1;
            let err = TransportError::Precondition(format!(
                "PRECONDITION_FAILED - injected failure declaring '{name}'"
            ));
            return Err(self.channel_error(&mut state, err));
        }

        match state.queues.get(name) {
            Some(queue) if queue.options != options || queue.arguments != arguments => {
                let err = TransportError::Precondition(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{name}'"
                ));
                Err(self.channel_error(&mut state, err))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    Queue {
                        options,
                        arguments,
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_session(self.id)?;
        if !state.queues.contains_key(queue) {
            let err = TransportError::Protocol(format!("NOT_FOUND - no queue '{queue}'"));
            return Err(self.channel_error(&mut state, err));
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.pattern == routing_key && b.queue == queue);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                pattern: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _flags: PublishFlags,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let weak = self.weak();
        let mut state = self.broker.state.lock();
        state.ensure_session(self.id)?;

        let nack = state.nack_next > 0;
        let confirm = match state.sessions.get_mut(&self.id) {
            Some(session) if session.confirm_mode => {
                session.publish_seq += 1;
                Some((session.publish_seq, session.confirm_tx.clone()))
            }
            _ => None,
        };

        if let Some((seq, confirm_tx)) = &confirm {
            if nack {
                state.nack_next -= 1;
                debug!("Negatively confirming publish {} on channel {}", seq, self.id);
                let _ = confirm_tx.send(Confirmation::Nack(*seq));
                return Ok(());
            }
        }

        let targets = state.route(exchange, routing_key);
        let stored = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body.clone(),
            persistent: message.is_persistent(),
            redelivered: false,
        };
        state.enqueue(&targets, &stored);
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body,
            persistent: stored.persistent,
            content_type: message.content_type,
            queues: targets,
        });

        if let Some((seq, confirm_tx)) = confirm {
            let _ = confirm_tx.send(Confirmation::Ack(seq));
        }
        state.dispatch(&weak);
        Ok(())
    }

    fn confirmations(&self) -> Option<ConfirmationStream> {
        self.confirms.lock().take()
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let weak = self.weak();
        let mut state = self.broker.state.lock();
        state.ensure_session(self.id)?;
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.prefetch = count;
        }
        state.dispatch(&weak);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        manual_ack: bool,
        _exclusive: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let weak = self.weak();
        let mut state = self.broker.state.lock();
        state.ensure_session(self.id)?;
        if !state.queues.contains_key(queue) {
            let err = TransportError::Protocol(format!("NOT_FOUND - no queue '{queue}'"));
            return Err(self.channel_error(&mut state, err));
        }

        let (tx, rx) = delivery_mpsc::unbounded();
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.consumers.push(ConsumerEntry {
                queue: queue.to_string(),
                manual_ack,
                tx,
            });
        }
        state.dispatch(&weak);
        Ok(rx.boxed())
    }

    fn closed(&self) -> ClosureSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let weak = self.weak();
        let mut state = self.broker.state.lock();
        if state.close_session(&weak, self.id, "closed by client") {
            Ok(())
        } else {
            Err(TransportError::Closed(format!(
                "channel {} is already closed",
                self.id
            )))
        }
    }
}

struct MemoryAcker {
    broker: Weak<Inner>,
    session: u64,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, multiple: bool, outcome: Settle) -> Result<(), TransportError> {
        let Some(broker) = self.broker.upgrade() else {
            return Err(TransportError::Closed("broker is gone".into()));
        };
        let weak = Arc::downgrade(&broker);
        let mut state = broker.state.lock();
        state.settle(&weak, self.session, self.tag, multiple, outcome)
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, multiple: bool) -> Result<(), TransportError> {
        self.settle(multiple, Settle::Ack)
    }

    async fn reject(&self, multiple: bool, requeue: bool) -> Result<(), TransportError> {
        let outcome = if requeue {
            Settle::Requeue
        } else {
            Settle::DeadLetter
        };
        self.settle(multiple, outcome)
    }
}
