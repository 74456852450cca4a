//! Queue topology and the dead-letter policy.
//!
//! Every session declares the same topology before it is considered Ready:
//!
//! ```text
//!   <exchange> ──key₁..keyₙ──> <queue> ──rejected without requeue──> "" ──> <queue>_dead_letter
//! ```
//!
//! A queue whose name already ends in [`DEAD_LETTER_SUFFIX`] is itself a
//! dead-letter queue and gets no dead-letter queue of its own.

use tracing::debug;

use crate::{
    config::Config,
    error::TransportError,
    transport::{QueueArguments, QueueOptions, Session},
};

/// Suffix appended to a queue name to form its dead-letter queue name.
pub const DEAD_LETTER_SUFFIX: &str = "_dead_letter";

/// Name of the dead-letter queue for `queue`, or `None` if `queue` already is one.
pub fn dead_letter_name(queue: &str) -> Option<String> {
    if queue.ends_with(DEAD_LETTER_SUFFIX) {
        None
    } else {
        Some(format!("{queue}{DEAD_LETTER_SUFFIX}"))
    }
}

/// Decides whether a delivery whose handler failed goes back onto its queue.
///
/// - Messages that were already dead-lettered (routing key ends in
///   [`DEAD_LETTER_SUFFIX`]) are always requeued.
/// - A first attempt (`redelivered == false`) is always requeued once.
/// - A failing redelivery is rejected without requeue, which routes it to the
///   dead-letter queue.
///
/// Dead-lettered messages that keep failing are requeued without limit.
pub fn requeue_on_failure(routing_key: &str, redelivered: bool) -> bool {
    routing_key.ends_with(DEAD_LETTER_SUFFIX) || !redelivered
}

/// The queues and bindings a client declares on every new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    queue: String,
    dead_letter: Option<String>,
    routing_keys: Vec<String>,
    exchange: String,
}

impl Topology {
    pub fn new(
        queue: impl Into<String>,
        routing_keys: Vec<String>,
        exchange: impl Into<String>,
    ) -> Self {
        let queue = queue.into();
        Self {
            dead_letter: dead_letter_name(&queue),
            queue,
            routing_keys,
            exchange: exchange.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.queue_name(),
            config.routing_keys.clone(),
            config.exchange.clone(),
        )
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn dead_letter_queue(&self) -> Option<&str> {
        self.dead_letter.as_deref()
    }

    pub fn routing_keys(&self) -> &[String] {
        &self.routing_keys
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Arguments of the main queue: dead-letter routing through the default
    /// exchange, when a dead-letter queue exists.
    pub fn queue_arguments(&self) -> QueueArguments {
        match &self.dead_letter {
            Some(dlq) => QueueArguments {
                dead_letter_exchange: Some(String::new()),
                dead_letter_routing_key: Some(dlq.clone()),
            },
            None => QueueArguments::default(),
        }
    }

    /// Declares the dead-letter queue, the main queue and all bindings.
    ///
    /// Stops at the first failure; the caller discards the session.
    pub async fn declare(&self, session: &dyn Session) -> Result<(), TransportError> {
        if let Some(dlq) = &self.dead_letter {
            session
                .declare_queue(dlq, QueueOptions::durable(), QueueArguments::default())
                .await?;
            debug!("Declared dead-letter queue '{}'", dlq);
        }

        session
            .declare_queue(&self.queue, QueueOptions::durable(), self.queue_arguments())
            .await?;
        debug!("Declared queue '{}'", self.queue);

        for key in &self.routing_keys {
            session.bind(&self.queue, key, &self.exchange).await?;
            debug!("Bound '{}' -> '{}' on '{}'", key, self.queue, self.exchange);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_name() {
        assert_eq!(
            dead_letter_name("orders").as_deref(),
            Some("orders_dead_letter")
        );
        assert_eq!(dead_letter_name("orders_dead_letter"), None);
    }

    #[test]
    fn test_requeue_policy_for_orders() {
        // First failure: one more try.
        assert!(requeue_on_failure("orders.created", false));
        // Second consecutive failure: dead-letter it.
        assert!(!requeue_on_failure("orders.created", true));
        // Already dead-lettered: keep it, whatever the flag says.
        assert!(requeue_on_failure("orders_dead_letter", true));
        assert!(requeue_on_failure("orders_dead_letter", false));
    }

    #[test]
    fn test_queue_arguments_point_at_dead_letter_queue() {
        let topology = Topology::new("orders", vec!["orders.*".into()], "amq.topic");
        let args = topology.queue_arguments();
        assert_eq!(args.dead_letter_exchange.as_deref(), Some(""));
        assert_eq!(
            args.dead_letter_routing_key.as_deref(),
            Some("orders_dead_letter")
        );
    }

    #[test]
    fn test_dead_letter_queue_has_no_arguments() {
        let topology = Topology::new("orders_dead_letter", vec![], "amq.topic");
        assert_eq!(topology.dead_letter_queue(), None);
        assert!(topology.queue_arguments().is_empty());
    }

    #[test]
    fn test_from_config_uses_default_queue_name() {
        let config = Config::new("", "amqp://localhost", ["a.b"]);
        let topology = Topology::from_config(&config);
        assert_eq!(topology.queue(), "default_queue_name");
        assert_eq!(
            topology.dead_letter_queue(),
            Some("default_queue_name_dead_letter")
        );
        assert_eq!(topology.exchange(), "amq.topic");
    }
}
