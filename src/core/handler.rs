//! Delivery handler run by the daemon.

use async_trait::async_trait;
use tracing::{debug, info};
use warren_amqp::{Delivery, DeliveryHandler, HandlerError};

/// Logs every delivery and acknowledges it.
///
/// Bodies are logged at debug level only, truncated to `preview` bytes.
#[derive(Debug, Clone)]
pub struct LogHandler {
    preview: usize,
}

impl Default for LogHandler {
    fn default() -> Self {
        Self { preview: 256 }
    }
}

impl LogHandler {
    pub fn new(preview: usize) -> Self {
        Self { preview }
    }

    fn preview(&self, body: &[u8]) -> String {
        let end = body.len().min(self.preview);
        let mut text = String::from_utf8_lossy(&body[..end]).into_owned();
        if end < body.len() {
            text.push_str("...");
        }
        text
    }
}

#[async_trait]
impl DeliveryHandler for LogHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        info!(
            "Received message on '{}' ({} bytes, redelivered: {})",
            delivery.routing_key,
            delivery.body.len(),
            delivery.redelivered
        );
        debug!("Message body: {}", self.preview(&delivery.body));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;
    use warren_amqp::{transport::memory::MemoryBroker, Client, Config};

    use super::*;

    #[test]
    fn test_preview_truncates_long_bodies() {
        let handler = LogHandler::new(4);
        assert_eq!(handler.preview(b"abc"), "abc");
        assert_eq!(handler.preview(b"abcdefgh"), "abcd...");
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_handler_logs_and_acks_deliveries() {
        let broker = MemoryBroker::new();
        let client = Client::open(
            Config::new("orders", "memory://", ["orders.*"]),
            broker.clone(),
        )
        .unwrap();
        let consumer = {
            let client = client.clone();
            tokio::spawn(async move { client.consume_with(LogHandler::default()).await })
        };

        assert!(client.wait_ready().await);
        client.push("orders.created", "hello").await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(logs_contain("Received message on 'orders.created' (5 bytes, redelivered: false)"));
        assert_eq!(broker.queue_len("orders"), Some(0));
        assert_eq!(broker.unacked(), 0);

        client.close().await.unwrap();
        consumer.await.unwrap();
    }
}
