//! In-memory transport implementation for testing
//!
//! A [`MemoryBroker`] holds queues and routing-key bindings for the whole
//! process. Every [`MemoryTransport`] attached to the same broker reaches the
//! queues of the others, which is enough to run masters, responders and
//! subscribers side by side in one process.
//!
//! Routing follows a direct exchange: a publish with routing key `k` lands in
//! every queue bound to `k` on the transport's exchange, and in the queue
//! literally named `k` if one exists (direct replies).
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::{
    ChannelId, ConsumerHandle, ConsumerOptions, Delivery, DeliveryHandler, Properties,
    RoutingOverride, Transport, TransportError,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Configuration for memory transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryOptions {
    /// Exchange the transport publishes to and binds queues on.
    pub exchange_name: String,
    /// Default routing key for publishes and queue bindings.
    pub routing_key: String,
}

impl MemoryOptions {
    /// Creates options for the given exchange and routing key.
    pub fn new(exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self::new("courier", "courier.default")
    }
}

#[derive(Clone, Debug)]
struct Envelope {
    payload: Bytes,
    properties: Properties,
}

struct Subscriber {
    consumer_tag: String,
    sender: flume::Sender<Envelope>,
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<Envelope>,
    consumers: Vec<Subscriber>,
    cursor: usize,
}

struct Queue {
    name: String,
    exclusive: bool,
    state: Mutex<QueueState>,
}

impl Queue {
    fn new(name: String, exclusive: bool) -> Self {
        Self {
            name,
            exclusive,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Hands the envelope to the next consumer in round-robin order, or
    /// keeps it until a consumer attaches.
    fn enqueue(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        let mut envelope = envelope;

        while !state.consumers.is_empty() {
            let index = state.cursor % state.consumers.len();
            state.cursor = state.cursor.wrapping_add(1);

            match state.consumers[index].sender.send(envelope) {
                Ok(()) => return,
                Err(flume::SendError(returned)) => {
                    // Receiver is gone, forget the consumer.
                    state.consumers.remove(index);
                    envelope = returned;
                }
            }
        }

        state.backlog.push_back(envelope);
    }

    fn attach(&self, consumer_tag: String, sender: flume::Sender<Envelope>) {
        let mut state = self.state.lock();

        while let Some(envelope) = state.backlog.pop_front() {
            if let Err(flume::SendError(returned)) = sender.send(envelope) {
                state.backlog.push_front(returned);
                return;
            }
        }

        state.consumers.push(Subscriber {
            consumer_tag,
            sender,
        });
    }

    fn detach(&self, consumer_tag: &str) {
        self.state
            .lock()
            .consumers
            .retain(|subscriber| subscriber.consumer_tag != consumer_tag);
    }

    fn depth(&self) -> usize {
        self.state.lock().backlog.len()
    }

    fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }
}

#[derive(Default)]
struct BrokerState {
    bindings: DashMap<(String, String), HashSet<String>>,
    next_channel: AtomicU64,
    queues: DashMap<String, Arc<Queue>>,
}

/// Process-wide broker shared by memory transports.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("queues", &self.state.queues.len())
            .field("bindings", &self.state.bindings.len())
            .finish()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport attached to this broker.
    #[must_use]
    pub fn transport(&self, options: MemoryOptions) -> MemoryTransport {
        MemoryTransport::new(self.clone(), options)
    }

    /// Whether a queue with the given name exists.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queues.contains_key(name)
    }

    /// Number of messages waiting in a queue for a consumer.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.queues.get(name).map(|queue| queue.depth())
    }

    /// Number of consumers attached to a queue.
    #[must_use]
    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .queues
            .get(name)
            .map_or(0, |queue| queue.consumer_count())
    }

    fn next_channel(&self) -> ChannelId {
        ChannelId(self.state.next_channel.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn declare(&self, name: &str, exclusive: bool) -> Arc<Queue> {
        self.state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Queue::new(name.to_string(), exclusive)))
            .clone()
    }

    fn bind(&self, exchange: &str, routing_key: &str, queue: &str) {
        self.state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default()
            .insert(queue.to_string());
    }

    fn delete(&self, name: &str) {
        self.state.queues.remove(name);
        for mut binding in self.state.bindings.iter_mut() {
            binding.value_mut().remove(name);
        }
        self.state.bindings.retain(|_, queues| !queues.is_empty());
    }

    fn route(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> usize {
        let mut names: Vec<String> = self
            .state
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .map(|bound| bound.iter().cloned().collect())
            .unwrap_or_default();

        if !names.iter().any(|name| name == routing_key) && self.has_queue(routing_key) {
            names.push(routing_key.to_string());
        }

        let targets: Vec<Arc<Queue>> = names
            .iter()
            .filter_map(|name| self.state.queues.get(name).map(|queue| queue.clone()))
            .collect();

        for queue in &targets {
            queue.enqueue(envelope.clone());
        }

        targets.len()
    }
}

struct ConsumerRecord {
    queue: Arc<Queue>,
    shutdown_token: CancellationToken,
}

/// Memory transport implementation
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    channel: ChannelId,
    closed: Arc<AtomicBool>,
    consumers: Arc<DashMap<String, ConsumerRecord>>,
    options: MemoryOptions,
    task_tracker: TaskTracker,
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("channel", &self.channel)
            .field("closed", &self.is_closed())
            .field("consumers", &self.consumers.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Create a new memory transport attached to `broker`.
    #[must_use]
    pub fn new(broker: MemoryBroker, options: MemoryOptions) -> Self {
        let channel = broker.next_channel();

        Self {
            broker,
            channel,
            closed: Arc::new(AtomicBool::new(false)),
            consumers: Arc::new(DashMap::new()),
            options,
            task_tracker: TaskTracker::new(),
        }
    }

    /// The broker this transport is attached to.
    #[must_use]
    pub const fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// The transport options.
    #[must_use]
    pub const fn options(&self) -> &MemoryOptions {
        &self.options
    }

    /// The channel consumers share unless they force a new one.
    #[must_use]
    pub const fn default_channel(&self) -> ChannelId {
        self.channel
    }

    /// Number of live consumers opened through this transport.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Whether [`Transport::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn release(&self, consumer_tag: &str) -> bool {
        let Some((_, record)) = self.consumers.remove(consumer_tag) else {
            return false;
        };

        record.queue.detach(consumer_tag);
        record.shutdown_token.cancel();

        if record.queue.exclusive {
            self.broker.delete(&record.queue.name);
        }

        true
    }

    #[allow(clippy::too_many_arguments)]
    async fn consume_loop(
        handler: Arc<dyn DeliveryHandler>,
        queue: Arc<Queue>,
        channel: ChannelId,
        receiver: flume::Receiver<Envelope>,
        prefetch: u16,
        shutdown_token: CancellationToken,
        task_tracker: TaskTracker,
    ) {
        let permits = (prefetch > 0).then(|| Arc::new(Semaphore::new(usize::from(prefetch))));

        loop {
            let envelope = tokio::select! {
                biased;
                () = shutdown_token.cancelled() => break,
                received = receiver.recv_async() => match received {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                },
            };

            let permit = match &permits {
                Some(permits) => tokio::select! {
                    biased;
                    () = shutdown_token.cancelled() => {
                        queue.enqueue(envelope);
                        break;
                    }
                    permit = Arc::clone(permits).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let delivery = Delivery {
                channel,
                payload: envelope.payload,
                properties: envelope.properties,
                queue_name: queue.name.clone(),
            };

            let handler = Arc::clone(&handler);
            task_tracker.spawn(async move {
                if !handler.deliver(delivery).await {
                    trace!("delivery was not handled");
                }
                drop(permit);
            });
        }

        // Anything still buffered goes back to the queue for other consumers.
        let leftovers: Vec<Envelope> = receiver.drain().collect();
        for envelope in leftovers {
            queue.enqueue(envelope);
        }

        debug!("consumer loop on queue {} exited", queue.name);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(
        &self,
        payload: Bytes,
        properties: Properties,
        routing: Option<RoutingOverride>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let routing_key = routing
            .and_then(|routing| routing.routing_key)
            .unwrap_or_else(|| self.options.routing_key.clone());

        let envelope = Envelope {
            payload,
            properties,
        };
        let routed = self
            .broker
            .route(&self.options.exchange_name, &routing_key, &envelope);

        if routed == 0 {
            debug!("no queue for routing key {}, message dropped", routing_key);
        } else {
            trace!("message routed to {} queue(s) via {}", routed, routing_key);
        }

        Ok(())
    }

    async fn open_consumer(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumerOptions,
    ) -> Result<ConsumerHandle, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let (queue_name, exclusive) = match options.queue_name {
            Some(name) if name.is_empty() => {
                return Err(TransportError::Consume(
                    "queue name must not be empty".to_string(),
                ));
            }
            Some(name) => (name, false),
            None => (format!("courier.gen-{}", Uuid::new_v4()), true),
        };

        let queue = self.broker.declare(&queue_name, exclusive);
        if options.binding {
            self.broker.bind(
                &self.options.exchange_name,
                &self.options.routing_key,
                &queue_name,
            );
        }

        let channel = if options.force_new_channel {
            self.broker.next_channel()
        } else {
            self.channel
        };

        let consumer_tag = format!("ctag-{}", Uuid::new_v4());
        let (sender, receiver) = flume::unbounded();
        let shutdown_token = CancellationToken::new();

        queue.attach(consumer_tag.clone(), sender);
        self.consumers.insert(
            consumer_tag.clone(),
            ConsumerRecord {
                queue: Arc::clone(&queue),
                shutdown_token: shutdown_token.clone(),
            },
        );

        self.task_tracker.spawn(Self::consume_loop(
            handler,
            queue,
            channel,
            receiver,
            options.prefetch,
            shutdown_token,
            self.task_tracker.clone(),
        ));

        debug!(
            "consumer {} opened on queue {} ({}, prefetch {})",
            consumer_tag, queue_name, channel, options.prefetch
        );

        Ok(ConsumerHandle {
            channel,
            consumer_tag,
            queue_name,
        })
    }

    async fn cancel_consumer(&self, handle: &ConsumerHandle) -> Result<(), TransportError> {
        if self.release(&handle.consumer_tag) {
            debug!(
                "queue {} consumer {} cancelled",
                handle.queue_name, handle.consumer_tag
            );
        } else {
            debug!(
                "queue {} consumer {} already cancelled",
                handle.queue_name, handle.consumer_tag
            );
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tags: Vec<String> = self
            .consumers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for tag in tags {
            self.release(&tag);
        }

        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("memory transport on {} closed", self.channel);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ForwardingHandler {
        sender: mpsc::UnboundedSender<Delivery>,
    }

    #[async_trait]
    impl DeliveryHandler for ForwardingHandler {
        async fn deliver(&self, delivery: Delivery) -> bool {
            self.sender.send(delivery).is_ok()
        }
    }

    fn forwarding_handler() -> (Arc<ForwardingHandler>, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(ForwardingHandler { sender }), receiver)
    }

    #[tokio::test]
    async fn test_direct_reply_to_unbound_queue() {
        let _ = tracing_subscriber::fmt::try_init();

        let broker = MemoryBroker::new();
        let transport = broker.transport(MemoryOptions::default());
        let (handler, mut receiver) = forwarding_handler();

        let handle = transport
            .open_consumer(
                handler,
                ConsumerOptions::default()
                    .queue_name("replies")
                    .binding(false)
                    .prefetch(1),
            )
            .await
            .unwrap();
        assert_eq!(handle.queue_name, "replies");
        assert_eq!(handle.channel, transport.default_channel());

        // Default routing key has no binding to the unbound queue.
        transport
            .publish(Bytes::from("ignored"), Properties::default(), None)
            .await
            .unwrap();

        transport
            .publish(
                Bytes::from("hello"),
                Properties::default().with_correlation_id("c-1"),
                Some(RoutingOverride::routing_key("replies")),
            )
            .await
            .unwrap();

        let delivery = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, Bytes::from("hello"));
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(delivery.queue_name, "replies");

        assert!(
            timeout(Duration::from_millis(50), receiver.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_bound_queues_share_routing_key() {
        let broker = MemoryBroker::new();
        let transport = broker.transport(MemoryOptions::new("events", "orders"));
        let (first, mut first_rx) = forwarding_handler();
        let (second, mut second_rx) = forwarding_handler();

        transport
            .open_consumer(first, ConsumerOptions::default().queue_name("audit"))
            .await
            .unwrap();
        transport
            .open_consumer(second, ConsumerOptions::default().queue_name("billing"))
            .await
            .unwrap();

        transport
            .publish(Bytes::from("order-1"), Properties::default(), None)
            .await
            .unwrap();

        for receiver in [&mut first_rx, &mut second_rx] {
            let delivery = timeout(Duration::from_secs(1), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.payload, Bytes::from("order-1"));
        }
    }

    #[tokio::test]
    async fn test_backlog_flushed_when_consumer_attaches() {
        let broker = MemoryBroker::new();
        let transport = broker.transport(MemoryOptions::default());
        let (observer, _observer_rx) = forwarding_handler();

        // Declare the queue, then leave it without consumers.
        let handle = transport
            .open_consumer(observer, ConsumerOptions::default().queue_name("jobs"))
            .await
            .unwrap();
        transport.cancel_consumer(&handle).await.unwrap();

        for payload in ["a", "b"] {
            transport
                .publish(Bytes::from(payload), Properties::default(), None)
                .await
                .unwrap();
        }
        assert_eq!(broker.queue_depth("jobs"), Some(2));

        let (handler, mut receiver) = forwarding_handler();
        transport
            .open_consumer(handler, ConsumerOptions::default().queue_name("jobs"))
            .await
            .unwrap();

        for expected in ["a", "b"] {
            let delivery = timeout(Duration::from_secs(1), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.payload, Bytes::from(expected));
        }
        assert_eq!(broker.queue_depth("jobs"), Some(0));
    }

    struct SlowHandler {
        active: AtomicUsize,
        max_active: AtomicUsize,
        seen: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl DeliveryHandler for SlowHandler {
        async fn deliver(&self, delivery: Delivery) -> bool {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.seen.lock().push(delivery.payload);
            self.active.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn test_prefetch_one_serializes_deliveries() {
        let broker = MemoryBroker::new();
        let transport = broker.transport(MemoryOptions::default());
        let handler = Arc::new(SlowHandler {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });

        transport
            .open_consumer(
                handler.clone(),
                ConsumerOptions::default().queue_name("serial").prefetch(1),
            )
            .await
            .unwrap();

        let expected: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("m{i}"))).collect();
        for payload in &expected {
            transport
                .publish(payload.clone(), Properties::default(), None)
                .await
                .unwrap();
        }

        timeout(Duration::from_secs(2), async {
            while handler.seen.lock().len() < expected.len() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.seen.lock(), expected);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_stops_delivery() {
        let broker = MemoryBroker::new();
        let transport = broker.transport(MemoryOptions::default());
        let (handler, mut receiver) = forwarding_handler();

        let handle = transport
            .open_consumer(
                handler,
                ConsumerOptions::default().binding(false).force_new_channel(true),
            )
            .await
            .unwrap();
        assert!(handle.queue_name.starts_with("courier.gen-"));
        assert_ne!(handle.channel, transport.default_channel());
        assert!(broker.has_queue(&handle.queue_name));

        transport.cancel_consumer(&handle).await.unwrap();
        transport.cancel_consumer(&handle).await.unwrap();

        // Generated queues go away with their consumer.
        assert!(!broker.has_queue(&handle.queue_name));
        assert_eq!(transport.consumer_count(), 0);

        transport
            .publish(
                Bytes::from("late"),
                Properties::default(),
                Some(RoutingOverride::routing_key(handle.queue_name.clone())),
            )
            .await
            .unwrap();

        assert!(
            timeout(Duration::from_millis(50), receiver.recv())
                .await
                .map_or(true, |delivery| delivery.is_none())
        );
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_work() {
        let broker = MemoryBroker::new();
        let transport = broker.transport(MemoryOptions::default());
        let (handler, _receiver) = forwarding_handler();

        transport
            .open_consumer(handler.clone(), ConsumerOptions::default().queue_name("q"))
            .await
            .unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
        assert_eq!(broker.consumer_count("q"), 0);

        assert_eq!(
            transport
                .publish(Bytes::from("x"), Properties::default(), None)
                .await,
            Err(TransportError::Closed)
        );
        assert_eq!(
            transport
                .open_consumer(handler, ConsumerOptions::default())
                .await
                .unwrap_err(),
            TransportError::Closed
        );
    }
}
