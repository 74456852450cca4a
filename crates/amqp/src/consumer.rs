//! Consuming with the ack / retry / dead-letter policy.
//!
//! The consumer loop reacts to three event sources: shutdown, closure of the
//! session it subscribed on, and inbound deliveries.
//!
//! ```text
//!              ┌──────── session closed / stream ended ────────┐
//!              v                                               │
//! ──> Subscribing ──ok──> Dispatching ──delivery──> handler ───┤
//!        │   ^                                                 │
//!     failed │                                                 │
//!        v   │                                                 │
//!   ResubscribeWait                    shutdown (any state) ──> Closed
//! ```
//!
//! Every subscription uses prefetch 1 and manual acknowledgement, so at most
//! one delivery is unacknowledged at a time. A successful handler acks the
//! delivery; a failing one rejects it, requeueing according to
//! [`requeue_on_failure`].

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::{
    client::Client,
    error::ClientError,
    signal::ClosureSignal,
    state::Shared,
    topology::requeue_on_failure,
    transport::{Delivery, DeliveryStream},
};

/// Prefetch count of every subscription.
pub const PREFETCH: u16 = 1;

/// Error type returned by delivery handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one delivery at a time.
///
/// Returning `Ok` acknowledges the delivery. Returning `Err` rejects it; a
/// first failure is requeued, a repeated one is dead-lettered.
///
/// # Examples
///
/// ```ignore
/// struct Audit;
///
/// #[async_trait]
/// impl DeliveryHandler for Audit {
///     async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
///         store(&delivery.body).await?;
///         Ok(())
///     }
/// }
///
/// client.consume_with(Audit).await;
/// ```
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: DeliveryHandler> DeliveryHandler for Arc<H> {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        self.as_ref().handle(delivery).await
    }
}

/// A [`DeliveryHandler`] built from an async closure. See [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps an async closure taking a [`Delivery`] into a [`DeliveryHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> DeliveryHandler for HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(delivery.clone()).await
    }
}

/// A live subscription and the closure signal of the session it runs on.
pub(crate) struct Subscription {
    pub(crate) deliveries: DeliveryStream,
    pub(crate) session_closed: ClosureSignal,
}

/// Subscribes to the topology's queue on the current Ready session.
pub(crate) async fn subscribe(shared: &Shared) -> Result<Subscription, ClientError> {
    let handle = shared.ready_session().ok_or(ClientError::NotConnected)?;
    let session = handle.session();
    session.set_prefetch(PREFETCH).await?;
    let deliveries = session
        .consume(shared.topology.queue(), true, false)
        .await?;
    Ok(Subscription {
        deliveries,
        session_closed: handle.closed().clone(),
    })
}

enum LoopState {
    Subscribing,
    Dispatching(Subscription),
    ResubscribeWait,
    Closed,
}

pub(crate) struct ConsumerLoop<H> {
    client: Client,
    handler: H,
}

impl<H: DeliveryHandler> ConsumerLoop<H> {
    pub(crate) fn new(client: Client, handler: H) -> Self {
        Self { client, handler }
    }

    /// Runs until shutdown, then closes the client.
    pub(crate) async fn run(self) {
        let shared = self.client.shared().clone();
        let shutdown = shared.shutdown.clone();
        let reconsume_delay = shared.timings.reconsume;

        tokio::select! {
            biased;
            _ = shutdown.wait() => {}
            _ = shared.wait_ready() => {}
            _ = tokio::time::sleep(shared.timings.startup_grace) => {}
        }

        let mut state = LoopState::Subscribing;
        loop {
            state = match state {
                LoopState::Subscribing if shutdown.is_triggered() => LoopState::Closed,
                LoopState::Subscribing => match subscribe(&shared).await {
                    Ok(subscription) => {
                        info!("Consuming from queue '{}'", shared.topology.queue());
                        LoopState::Dispatching(subscription)
                    }
                    Err(e) => {
                        warn!(
                            "Failed to subscribe: {}. Retrying in {:.2} seconds",
                            e,
                            reconsume_delay.as_secs_f64()
                        );
                        LoopState::ResubscribeWait
                    }
                },
                LoopState::ResubscribeWait => tokio::select! {
                    biased;
                    _ = shutdown.wait() => LoopState::Closed,
                    _ = tokio::time::sleep(reconsume_delay) => LoopState::Subscribing,
                },
                LoopState::Dispatching(mut subscription) => tokio::select! {
                    biased;
                    _ = shutdown.wait() => LoopState::Closed,
                    reason = subscription.session_closed.fired() => {
                        warn!("Session closed while consuming: {}. Resubscribing", reason);
                        LoopState::Subscribing
                    }
                    next = subscription.deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            self.dispatch(delivery).await;
                            LoopState::Dispatching(subscription)
                        }
                        Some(Err(e)) => {
                            warn!("Delivery stream failed: {}. Resubscribing", e);
                            LoopState::Subscribing
                        }
                        None => {
                            warn!("Delivery stream ended. Resubscribing");
                            LoopState::Subscribing
                        }
                    },
                },
                LoopState::Closed => break,
            };
        }

        match self.client.close().await {
            Ok(()) => info!("Consumer stopped, broker client closed"),
            Err(ClientError::AlreadyClosed) => debug!("Consumer stopped, broker client already closed"),
            Err(e) => warn!("Consumer stopped, failed to close broker client: {}", e),
        }
    }

    /// Runs the handler and settles the delivery.
    async fn dispatch(&self, delivery: Delivery) {
        trace!(
            "Dispatching delivery {} from '{}' ({} bytes, redelivered: {})",
            delivery.delivery_tag,
            delivery.routing_key,
            delivery.body.len(),
            delivery.redelivered
        );

        match self.handler.handle(&delivery).await {
            Ok(()) => {
                if let Err(e) = delivery.ack(false).await {
                    warn!("Failed to ack delivery {}: {}", delivery.delivery_tag, e);
                }
            }
            Err(e) => {
                let err = ClientError::Handler(e.to_string());
                let requeue = requeue_on_failure(&delivery.routing_key, delivery.redelivered);
                warn!(
                    "{} (routing key '{}', redelivered: {}). Rejecting with requeue={}",
                    err, delivery.routing_key, delivery.redelivered, requeue
                );
                if let Err(e) = delivery.reject(false, requeue).await {
                    warn!("Failed to reject delivery {}: {}", delivery.delivery_tag, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tracing_test::traced_test;

    use super::*;
    use crate::{config::Config, transport::memory::MemoryBroker};

    fn client(broker: &MemoryBroker, queue: &str) -> Client {
        Client::open(Config::new(queue, "memory://", ["orders.*"]), broker.clone()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_handler_acks() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "orders");
        let handled = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let client = client.clone();
            let handled = handled.clone();
            tokio::spawn(async move {
                client
                    .consume_func(move |_delivery| {
                        let handled = handled.clone();
                        async move {
                            handled.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await
            })
        };

        assert!(client.wait_ready().await);
        client.push("orders.created", "a").await.unwrap();
        client.push("orders.created", "b").await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(handled.load(Ordering::SeqCst), 2);
        assert_eq!(broker.queue_len("orders"), Some(0));
        assert_eq!(broker.unacked(), 0);

        client.close().await.unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_failing_handler_dead_letters_on_second_attempt() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "orders");
        let attempts = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let client = client.clone();
            let attempts = attempts.clone();
            tokio::spawn(async move {
                client
                    .consume_func(move |_delivery| {
                        let attempts = attempts.clone();
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            Err::<(), HandlerError>("boom".into())
                        }
                    })
                    .await
            })
        };

        assert!(client.wait_ready().await);
        client.push("orders.created", "m").await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let dead = broker.messages("orders_dead_letter").unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].routing_key, "orders_dead_letter");
        assert!(logs_contain("Handler error: boom"));

        client.close().await.unwrap();
        consumer.await.unwrap();
    }

    /// Spawns a consumer that reports the instant of every handled delivery.
    fn spawn_timed(
        client: &Client,
    ) -> (
        tokio::task::JoinHandle<()>,
        tokio::sync::mpsc::UnboundedReceiver<tokio::time::Instant>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let client = client.clone();
        let task = tokio::spawn(async move {
            client
                .consume_func(move |_delivery| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(tokio::time::Instant::now());
                        Ok(())
                    }
                })
                .await
        });
        (task, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscribe_waits_reconsume_delay() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let started = tokio::time::Instant::now();
        let client = client(&broker, "orders");
        let (consumer, mut handled) = spawn_timed(&client);

        // Grace runs out at 1s and the subscribe fails; the retry is due at 6s.
        tokio::time::sleep(Duration::from_secs(2)).await;
        broker.set_reachable(true);
        assert!(client.wait_ready().await);
        assert!(started.elapsed() < Duration::from_secs(6));
        client.push("orders.created", "m").await.unwrap();

        let at = handled.recv().await.unwrap();
        assert!(at - started >= Duration::from_secs(6));
        assert!(at - started < Duration::from_secs(7));

        client.close().await.unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_resubscribe_wait() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let client = client(&broker, "orders");
        let (consumer, _handled) = spawn_timed(&client);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let started = tokio::time::Instant::now();
        assert!(matches!(client.close().await, Err(ClientError::AlreadyClosed)));
        consumer.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_subscribe_does_not_wait_when_ready() {
        let broker = MemoryBroker::new();
        let started = tokio::time::Instant::now();
        let client = client(&broker, "orders");
        let (consumer, mut handled) = spawn_timed(&client);

        assert!(client.wait_ready().await);
        client.push("orders.created", "m").await.unwrap();
        let at = handled.recv().await.unwrap();
        assert!(at - started < client.shared().timings.startup_grace);

        client.close().await.unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_first_subscribe_waits_at_most_startup_grace() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let client = client(&broker, "orders");
        let (consumer, _handled) = spawn_timed(&client);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(!logs_contain("Failed to subscribe"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(logs_contain("Failed to subscribe: not connected to a server"));

        let _ = client.close().await;
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_close_after_shutdown_is_quiet() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "orders");
        let consumer = {
            let client = client.clone();
            tokio::spawn(async move { client.consume_func(|_d| async { Ok(()) }).await })
        };
        assert!(client.wait_ready().await);
        tokio::time::sleep(Duration::from_secs(2)).await;

        client.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(client.close().await, Err(ClientError::AlreadyClosed)));
    }
}
