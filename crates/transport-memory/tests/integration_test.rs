//! Integration tests for memory transport

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::{
    ConsumerOptions, Delivery, DeliveryHandler, Properties, RoutingOverride, Transport,
};
use courier_transport_memory::{MemoryBroker, MemoryOptions, MemoryTransport};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

/// Replies to every request on its `reply_to` queue with the same body.
struct EchoResponder {
    transport: MemoryTransport,
}

#[async_trait]
impl DeliveryHandler for EchoResponder {
    async fn deliver(&self, delivery: Delivery) -> bool {
        let Some(reply_to) = delivery.properties.reply_to.clone() else {
            return false;
        };

        info!("echoing {} bytes to {}", delivery.payload.len(), reply_to);

        let mut properties = Properties::default().with_headers(delivery.properties.headers);
        properties.correlation_id = delivery.properties.correlation_id;

        self.transport
            .publish(
                delivery.payload,
                properties,
                Some(RoutingOverride::routing_key(reply_to)),
            )
            .await
            .is_ok()
    }
}

struct Collector {
    sender: mpsc::UnboundedSender<Delivery>,
}

#[async_trait]
impl DeliveryHandler for Collector {
    async fn deliver(&self, delivery: Delivery) -> bool {
        self.sender.send(delivery).is_ok()
    }
}

#[tokio::test]
async fn test_memory_echo_server() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let options = MemoryOptions::new("courier", "echo.requests");

    // Server side: bound queue on the request routing key.
    let server = broker.transport(options.clone());
    server
        .open_consumer(
            Arc::new(EchoResponder {
                transport: server.clone(),
            }),
            ConsumerOptions::default().queue_name("echo.worker"),
        )
        .await
        .expect("Failed to open server consumer");

    // Client side: generated reply queue.
    let client = broker.transport(options);
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let reply = client
        .open_consumer(
            Arc::new(Collector { sender }),
            ConsumerOptions::default().binding(false).prefetch(1),
        )
        .await
        .expect("Failed to open reply consumer");

    let test_messages = vec![
        Bytes::from("Hello, Memory!"),
        Bytes::from("Test message 2"),
        Bytes::from("🦀 Rust is awesome!"),
    ];

    for (i, msg) in test_messages.into_iter().enumerate() {
        client
            .publish(
                msg.clone(),
                Properties::default()
                    .with_correlation_id(format!("c-{i}"))
                    .with_reply_to(reply.queue_name.clone()),
                None,
            )
            .await
            .expect("Failed to publish");

        let response = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("Timeout")
            .expect("Reply channel closed");

        assert_eq!(response.payload, msg);
        assert_eq!(
            response.properties.correlation_id.as_deref(),
            Some(format!("c-{i}").as_str())
        );
    }

    client.close().await.expect("Failed to close client");
    server.close().await.expect("Failed to close server");
    assert!(!broker.has_queue(&reply.queue_name));
}

#[tokio::test]
async fn test_competing_consumers_round_robin() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let transport = broker.transport(MemoryOptions::new("courier", "work"));

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();

    for sender in [first_tx, second_tx] {
        transport
            .open_consumer(
                Arc::new(Collector { sender }),
                ConsumerOptions::default().queue_name("workers").prefetch(1),
            )
            .await
            .expect("Failed to open consumer");
    }

    for i in 0..4 {
        transport
            .publish(Bytes::from(format!("job-{i}")), Properties::default(), None)
            .await
            .expect("Failed to publish");
    }

    let mut first = Vec::new();
    let mut second = Vec::new();
    for _ in 0..2 {
        first.push(
            timeout(Duration::from_secs(1), first_rx.recv())
                .await
                .expect("Timeout")
                .expect("closed")
                .payload,
        );
        second.push(
            timeout(Duration::from_secs(1), second_rx.recv())
                .await
                .expect("Timeout")
                .expect("closed")
                .payload,
        );
    }

    assert_eq!(first, vec![Bytes::from("job-0"), Bytes::from("job-2")]);
    assert_eq!(second, vec![Bytes::from("job-1"), Bytes::from("job-3")]);
}
