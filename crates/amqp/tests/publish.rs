mod common;

use std::time::Duration;

use tokio::time::Instant;
use warren_amqp::{transport::memory::MemoryBroker, ClientError};

#[tokio::test(start_paused = true)]
async fn confirmed_push_is_published_exactly_once() {
    let broker = MemoryBroker::new();
    let client = common::open(&broker, "orders", &["orders.*"]);
    assert!(client.wait_ready().await);

    broker.nack_next_publishes(3);
    client.push("orders.created", "order-1").await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.routing_key, "orders.created");
    assert_eq!(message.body, "order-1");
    assert!(message.persistent);
    assert_eq!(message.queues, vec!["orders".to_string()]);

    let (options, _) = broker.queue_declaration("orders").unwrap();
    assert!(options.durable);

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn push_waits_out_an_outage_and_then_confirms() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let client = common::open(&broker, "orders", &["orders.*"]);

    let pusher = {
        let client = client.clone();
        tokio::spawn(async move { client.push("orders.created", "during-outage").await })
    };

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(!pusher.is_finished());
    assert!(broker.published().is_empty());

    broker.set_reachable(true);
    tokio::time::timeout(Duration::from_secs(30), pusher)
        .await
        .expect("push finished")
        .unwrap()
        .unwrap();
    assert_eq!(broker.published().len(), 1);
    assert_eq!(broker.queue_len("orders"), Some(1));

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unsafe_push_fails_fast_when_not_ready() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let client = common::open(&broker, "orders", &["orders.*"]);

    let err = client.unsafe_push("orders.created", "x").await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
    assert_eq!(err.to_string(), "not connected to a server");

    let _ = client.close().await;
}

#[tokio::test(start_paused = true)]
async fn unsafe_push_does_not_wait_for_confirmation() {
    let broker = MemoryBroker::new();
    let client = common::open(&broker, "orders", &["orders.*"]);
    assert!(client.wait_ready().await);

    broker.nack_next_publishes(1);
    // A negative confirmation is not reported to unsafe_push callers.
    client.unsafe_push("orders.created", "x").await.unwrap();
    client.unsafe_push("orders.created", "y").await.unwrap();
    assert_eq!(broker.published().len(), 1);

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_a_waiting_push_promptly() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let client = common::open(&broker, "orders", &["orders.*"]);

    let pusher = {
        let client = client.clone();
        tokio::spawn(async move { client.push("orders.created", "never").await })
    };
    // Inside the first resend wait.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = Instant::now();
    assert!(matches!(client.close().await, Err(ClientError::AlreadyClosed)));
    let result = pusher.await.unwrap();
    assert!(matches!(result, Err(ClientError::Shutdown)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn sequential_pushes_each_confirm_their_own_publish() {
    let broker = MemoryBroker::new();
    let client = common::open(&broker, "orders", &["orders.*"]);
    assert!(client.wait_ready().await);

    let mut pushers = Vec::new();
    for i in 0..5 {
        let client = client.clone();
        pushers.push(tokio::spawn(async move {
            client.push("orders.created", format!("order-{i}")).await
        }));
    }
    for pusher in pushers {
        pusher.await.unwrap().unwrap();
    }

    let mut bodies: Vec<String> = broker
        .published()
        .iter()
        .map(|m| String::from_utf8_lossy(&m.body).to_string())
        .collect();
    bodies.sort();
    assert_eq!(
        bodies,
        (0..5).map(|i| format!("order-{i}")).collect::<Vec<_>>()
    );

    client.close().await.unwrap();
}
