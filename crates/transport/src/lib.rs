//! Broker-agnostic transport abstraction.
//!
//! The RPC engine only ever talks to a broker through the [`Transport`]
//! trait. Implementations own connections, queue declaration and the wire
//! protocol; the engine owns correlation and lifecycle.
//!
//! Transports handle:
//! - Fire-and-forget publishing with message properties
//! - Opening consumers that push deliveries into a [`DeliveryHandler`]
//! - Per-consumer prefetch limits and channel assignment
//! - Idempotent consumer cancellation
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::TransportError;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Message headers as carried on the wire.
pub type Headers = HashMap<String, String>;

/// Per-message properties.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    /// Correlation id linking a response to its request.
    pub correlation_id: Option<String>,
    /// Application headers.
    pub headers: Headers,
    /// Queue a responder should publish replies to.
    pub reply_to: Option<String>,
}

impl Properties {
    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Replaces all headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply-to queue.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Overrides applied to a single publish.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingOverride {
    /// Routing key to use instead of the transport's default.
    pub routing_key: Option<String>,
}

impl RoutingOverride {
    /// Routes the message with the given key.
    #[must_use]
    pub fn routing_key(key: impl Into<String>) -> Self {
        Self {
            routing_key: Some(key.into()),
        }
    }
}

/// Identifier of a transport channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Handle returned when a consumer is opened.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConsumerHandle {
    /// Channel the consumer lives on.
    pub channel: ChannelId,
    /// Tag identifying the consumer on its channel.
    pub consumer_tag: String,
    /// Queue the consumer reads from.
    pub queue_name: String,
}

/// Options used when opening a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Bind the queue to the transport's routing key. Unbound queues only
    /// receive messages addressed to them directly.
    pub binding: bool,
    /// Open the consumer on a fresh channel instead of the shared one.
    pub force_new_channel: bool,
    /// Maximum unacknowledged deliveries in flight. Zero means unlimited.
    pub prefetch: u16,
    /// Queue to consume from. `None` asks the broker for a generated,
    /// exclusive queue that is removed when the consumer is cancelled.
    pub queue_name: Option<String>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            binding: true,
            force_new_channel: false,
            prefetch: 0,
            queue_name: None,
        }
    }
}

impl ConsumerOptions {
    /// Sets the queue name.
    #[must_use]
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Sets whether the queue is bound to the routing key.
    #[must_use]
    pub const fn binding(mut self, binding: bool) -> Self {
        self.binding = binding;
        self
    }

    /// Sets the prefetch limit.
    #[must_use]
    pub const fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets whether a new channel is opened for the consumer.
    #[must_use]
    pub const fn force_new_channel(mut self, force_new_channel: bool) -> Self {
        self.force_new_channel = force_new_channel;
        self
    }
}

/// An inbound message handed to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Channel the message arrived on.
    pub channel: ChannelId,
    /// Raw message body.
    pub payload: Bytes,
    /// Message properties.
    pub properties: Properties,
    /// Queue the message was consumed from.
    pub queue_name: String,
}

/// Receives deliveries for a consumer.
///
/// Returns whether the delivery was handled. Unhandled deliveries are
/// still acknowledged; the flag only feeds logs and tests.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Handles a single delivery.
    async fn deliver(&self, delivery: Delivery) -> bool;
}

/// Transport trait for publishing and consuming messages.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publishes a message. Fire-and-forget: success means the broker
    /// accepted the message, not that anyone consumed it.
    async fn publish(
        &self,
        payload: Bytes,
        properties: Properties,
        routing: Option<RoutingOverride>,
    ) -> Result<(), TransportError>;

    /// Opens a consumer that pushes every delivery into `handler`.
    async fn open_consumer(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumerOptions,
    ) -> Result<ConsumerHandle, TransportError>;

    /// Cancels a consumer. Cancelling an unknown or already cancelled
    /// consumer succeeds.
    async fn cancel_consumer(&self, handle: &ConsumerHandle) -> Result<(), TransportError>;

    /// Releases all transport resources.
    async fn close(&self) -> Result<(), TransportError>;
}
