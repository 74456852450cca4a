mod common;

use std::time::Duration;

use warren_amqp::transport::memory::MemoryBroker;

#[tokio::test(start_paused = true)]
async fn topology_declares_dead_letter_queue_first() {
    let broker = MemoryBroker::new();
    let client = common::open(&broker, "orders", &["orders.created", "orders.cancelled"]);
    assert!(client.wait_ready().await);

    let (dlq_options, dlq_args) = broker.queue_declaration("orders_dead_letter").unwrap();
    assert!(dlq_options.durable);
    assert!(dlq_args.is_empty());

    let (options, args) = broker.queue_declaration("orders").unwrap();
    assert!(options.durable && !options.auto_delete && !options.exclusive);
    assert_eq!(args.dead_letter_exchange.as_deref(), Some(""));
    assert_eq!(args.dead_letter_routing_key.as_deref(), Some("orders_dead_letter"));

    let mut bindings = broker.bindings("orders");
    bindings.sort();
    assert_eq!(
        bindings,
        vec![
            ("amq.topic".to_string(), "orders.cancelled".to_string()),
            ("amq.topic".to_string(), "orders.created".to_string()),
        ]
    );

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dead_letter_queue_gets_no_dead_letter_queue() {
    let broker = MemoryBroker::new();
    let client = common::open(&broker, "orders_dead_letter", &[]);
    assert!(client.wait_ready().await);

    assert!(broker.queue_declaration("orders_dead_letter_dead_letter").is_none());
    let (_, args) = broker.queue_declaration("orders_dead_letter").unwrap();
    assert!(args.is_empty());

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_message_is_retried_once_then_dead_lettered() {
    let broker = MemoryBroker::new();
    let client = common::open(&broker, "orders", &["orders.*"]);
    let seen = common::Seen::default();
    let consumer = common::spawn_consumer(&client, seen.clone(), |_, _| true);
    assert!(client.wait_ready().await);

    client.push("orders.created", "poison").await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    // First delivery requeued, second dead-lettered.
    assert_eq!(
        seen.entries(),
        vec![("poison".to_string(), false), ("poison".to_string(), true)]
    );
    assert_eq!(broker.queue_len("orders"), Some(0));
    let dead = broker.messages("orders_dead_letter").unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].routing_key, "orders_dead_letter");
    assert_eq!(dead[0].body, "poison");

    client.close().await.unwrap();
    consumer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn first_failure_is_retried_and_can_succeed() {
    let broker = MemoryBroker::new();
    let client = common::open(&broker, "orders", &["orders.*"]);
    let seen = common::Seen::default();
    let consumer = common::spawn_consumer(&client, seen.clone(), |attempt, _| attempt == 1);
    assert!(client.wait_ready().await);

    client.push("orders.created", "flaky").await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(seen.len(), 2);
    assert_eq!(broker.queue_len("orders"), Some(0));
    assert_eq!(broker.queue_len("orders_dead_letter"), Some(0));
    assert_eq!(broker.unacked(), 0);

    client.close().await.unwrap();
    consumer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dead_lettered_messages_are_always_requeued() {
    let broker = MemoryBroker::new();
    let client = common::open(&broker, "orders_dead_letter", &[]);
    let seen = common::Seen::default();
    // Fails five times, then recovers.
    let consumer = common::spawn_consumer(&client, seen.clone(), |attempt, _| attempt <= 5);
    assert!(client.wait_ready().await);

    broker.inject("", "orders_dead_letter", "escalated");
    tokio::time::sleep(Duration::from_secs(3)).await;

    let entries = seen.entries();
    assert_eq!(entries.len(), 6);
    assert!(entries[1..].iter().all(|(_, redelivered)| *redelivered));
    assert_eq!(broker.queue_len("orders_dead_letter"), Some(0));
    assert_eq!(broker.unacked(), 0);

    client.close().await.unwrap();
    consumer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn at_most_one_delivery_is_unacknowledged() {
    let broker = MemoryBroker::new();
    let client = common::open(&broker, "orders", &["orders.*"]);
    assert!(client.wait_ready().await);
    for i in 0..10 {
        client.push("orders.created", format!("m{i}")).await.unwrap();
    }

    let seen = common::Seen::default();
    let consumer = common::spawn_consumer(&client, seen.clone(), |_, _| false);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(seen.bodies(), (0..10).map(|i| format!("m{i}")).collect::<Vec<_>>());
    assert_eq!(broker.peak_unacked(), 1);

    client.close().await.unwrap();
    consumer.await.unwrap();
}
