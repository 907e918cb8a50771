//! One-way publish / subscribe over a transport.

use std::sync::Arc;

use async_trait::async_trait;
use courier_transport::{
    ConsumerHandle, ConsumerOptions, Delivery, DeliveryHandler, Headers, Properties,
    RoutingOverride, Transport,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PubsubConfig;
use crate::error::{Error, Result};
use crate::message::{Message, Payload};

/// Receives messages for a subscription.
#[async_trait]
pub trait PubsubListener: Send + Sync + 'static {
    /// Handles one message.
    async fn process_message(&self, message: Message);
}

struct SubscriptionHandler {
    listener: Arc<dyn PubsubListener>,
}

#[async_trait]
impl DeliveryHandler for SubscriptionHandler {
    async fn deliver(&self, delivery: Delivery) -> bool {
        self.listener.process_message(Message::from(delivery)).await;
        true
    }
}

/// Publishes fire-and-forget messages and manages subscriptions.
pub struct PubsubHandler<T: Transport> {
    config: PubsubConfig,
    subscriptions: Mutex<Vec<ConsumerHandle>>,
    transport: Arc<T>,
}

impl<T: Transport> PubsubHandler<T> {
    /// Creates a handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Construction`] if the subscriber name is empty.
    pub fn new(transport: Arc<T>, config: PubsubConfig) -> Result<Self> {
        if config.subscriber_name.as_deref() == Some("") {
            return Err(Error::Construction(
                "subscriber name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            config,
            subscriptions: Mutex::new(Vec::new()),
            transport,
        })
    }

    /// Publishes `data` with `headers`, optionally overriding the routing key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the publish fails.
    pub async fn publish(
        &self,
        data: impl Into<Payload> + Send,
        headers: Headers,
        routing_key: Option<&str>,
    ) -> Result<()> {
        let routing = routing_key.map(RoutingOverride::routing_key);
        self.transport
            .publish(
                data.into().into_bytes(),
                Properties::default().with_headers(headers),
                routing,
            )
            .await?;
        debug!("message published, routing key {:?}", routing_key);
        Ok(())
    }

    /// Subscribes `listener` to the subscriber queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the consumer cannot be opened.
    pub async fn subscribe(&self, listener: Arc<dyn PubsubListener>) -> Result<ConsumerHandle> {
        let mut options = ConsumerOptions::default()
            .binding(true)
            .prefetch(self.config.prefetch);
        if let Some(name) = &self.config.subscriber_name {
            options = options.queue_name(name.clone());
        }

        let handle = self
            .transport
            .open_consumer(Arc::new(SubscriptionHandler { listener }), options)
            .await?;

        info!(
            "subscribed {} on {}",
            handle.consumer_tag, handle.queue_name
        );
        self.subscriptions.lock().push(handle.clone());
        Ok(handle)
    }

    /// Cancels one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the cancel fails.
    pub async fn unsubscribe(&self, handle: &ConsumerHandle) -> Result<()> {
        self.subscriptions.lock().retain(|h| h != handle);
        self.transport.cancel_consumer(handle).await?;
        Ok(())
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Cancels all subscriptions and closes the transport. Failures are
    /// logged.
    pub async fn close(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for handle in subscriptions {
            if let Err(e) = self.transport.cancel_consumer(&handle).await {
                warn!("failed to cancel subscription {}: {}", handle.consumer_tag, e);
            }
        }

        if let Err(e) = self.transport.close().await {
            warn!("failed to close transport: {}", e);
        }
    }
}
