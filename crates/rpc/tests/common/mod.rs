//! Shared fixtures for RPC integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::{
    ChannelId, ConsumerHandle, ConsumerOptions, Delivery, DeliveryHandler, Headers, Properties,
    RoutingOverride, Transport, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A publish captured by [`RecordingTransport`].
#[derive(Clone, Debug)]
pub struct Published {
    pub payload: Bytes,
    pub properties: Properties,
    pub routing: Option<RoutingOverride>,
}

/// A consumer opened on [`RecordingTransport`].
#[derive(Clone)]
pub struct Opened {
    pub handle: ConsumerHandle,
    pub options: ConsumerOptions,
    pub handler: Arc<dyn DeliveryHandler>,
}

/// Records every call and lets tests inject deliveries by hand.
#[derive(Default)]
pub struct RecordingTransport {
    cancelled: Mutex<Vec<ConsumerHandle>>,
    closed: AtomicBool,
    fail_publish: AtomicBool,
    hold_opens: AtomicBool,
    next_id: AtomicU64,
    opened: Mutex<Vec<Opened>>,
    opening: AtomicUsize,
    opens_released: Notify,
    published: Mutex<Vec<Published>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// While held, `open_consumer` blocks until released.
    pub fn hold_opens(&self, hold: bool) {
        self.hold_opens.store(hold, Ordering::SeqCst);
        if !hold {
            self.opens_released.notify_waiters();
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn opened(&self) -> Vec<Opened> {
        self.opened.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<ConsumerHandle> {
        self.cancelled.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Delivers `body` to the consumer on the request's reply queue, as a
    /// responder would.
    pub async fn reply(&self, correlation_id: &str, body: &str, headers: Headers) -> bool {
        let request = self
            .published()
            .into_iter()
            .find(|p| p.properties.correlation_id.as_deref() == Some(correlation_id))
            .expect("no request with that correlation id");
        let reply_to = request.properties.reply_to.expect("request has no reply-to");

        let opened = self
            .opened()
            .into_iter()
            .find(|o| o.handle.queue_name == reply_to)
            .expect("no consumer on reply queue");

        opened
            .handler
            .deliver(Delivery {
                channel: opened.handle.channel,
                payload: Bytes::from(body.to_string()),
                properties: Properties::default()
                    .with_headers(headers)
                    .with_correlation_id(correlation_id),
                queue_name: reply_to,
            })
            .await
    }

    /// Polls until `count` calls have entered `open_consumer`.
    pub async fn wait_for_opening(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while self.opening.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no consumer open started in time");
    }

    /// Polls until `count` consumers have been cancelled.
    pub async fn wait_for_cancels(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while self.cancelled.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumers were not cancelled in time");
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(
        &self,
        payload: Bytes,
        properties: Properties,
        routing: Option<RoutingOverride>,
    ) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("broker unavailable".to_string()));
        }
        self.published.lock().push(Published {
            payload,
            properties,
            routing,
        });
        Ok(())
    }

    async fn open_consumer(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumerOptions,
    ) -> Result<ConsumerHandle, TransportError> {
        self.opening.fetch_add(1, Ordering::SeqCst);
        loop {
            let released = self.opens_released.notified();
            if !self.hold_opens.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = ConsumerHandle {
            channel: ChannelId(0),
            consumer_tag: format!("ctag-{id}"),
            queue_name: options
                .queue_name
                .clone()
                .unwrap_or_else(|| format!("gen-{id}")),
        };
        self.opened.lock().push(Opened {
            handle: handle.clone(),
            options,
            handler,
        });
        Ok(handle)
    }

    async fn cancel_consumer(&self, handle: &ConsumerHandle) -> Result<(), TransportError> {
        self.cancelled.lock().push(handle.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
