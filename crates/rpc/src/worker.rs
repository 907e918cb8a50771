//! The responding side: consumes requests and replies by routine id.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::{
    ConsumerHandle, ConsumerOptions, Delivery, DeliveryHandler, Properties, RoutingOverride,
    Transport,
};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::checker::PING_ROUTINE;
use crate::config::RpcWorkerConfig;
use crate::error::{Error, Result};
use crate::message::{
    Message, REQUEST_ID_HEADER, ROUTINE_ID_HEADER, STATUS_COMPLETED, STATUS_FAILED, STATUS_HEADER,
};

/// Handles requests for one routine.
#[async_trait]
pub trait RoutineHandler: Send + Sync + 'static {
    /// Produces the reply body, or an error text sent back with a `failed`
    /// status.
    async fn handle(&self, request: Message) -> std::result::Result<Bytes, String>;
}

#[async_trait]
impl<F, Fut> RoutineHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Bytes, String>> + Send + 'static,
{
    async fn handle(&self, request: Message) -> std::result::Result<Bytes, String> {
        (self)(request).await
    }
}

type Routines = Arc<DashMap<String, Arc<dyn RoutineHandler>>>;

struct RequestDispatcher<T: Transport> {
    routines: Routines,
    transport: Arc<T>,
}

#[async_trait]
impl<T: Transport> DeliveryHandler for RequestDispatcher<T> {
    async fn deliver(&self, delivery: Delivery) -> bool {
        let Some(reply_to) = delivery.properties.reply_to.clone() else {
            warn!("request on {} has no reply-to, dropped", delivery.queue_name);
            return false;
        };
        let correlation_id = delivery.properties.correlation_id.clone();
        let request = Message::from(delivery);
        let routine_id = request.header(ROUTINE_ID_HEADER).unwrap_or_default().to_string();

        let handler = self.routines.get(&routine_id).map(|entry| entry.value().clone());
        let outcome = match handler {
            Some(handler) => handler.handle(request.clone()).await,
            None if routine_id == PING_ROUTINE => Ok(request.payload().clone()),
            None => {
                trace!("no handler for routine {:?}, skipped", routine_id);
                return false;
            }
        };

        let (status, body) = match outcome {
            Ok(body) => (STATUS_COMPLETED, body),
            Err(reason) => {
                debug!("routine {} failed: {}", routine_id, reason);
                (STATUS_FAILED, Bytes::from(reason))
            }
        };

        let mut properties = Properties::default().with_header(STATUS_HEADER, status);
        for key in [REQUEST_ID_HEADER, ROUTINE_ID_HEADER] {
            if let Some(value) = request.header(key) {
                properties = properties.with_header(key, value);
            }
        }
        properties.correlation_id = correlation_id;

        match self
            .transport
            .publish(body, properties, Some(RoutingOverride::routing_key(reply_to)))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to publish reply for {}: {}", routine_id, e);
                false
            }
        }
    }
}

/// Consumes requests from an operator queue and answers them with the
/// handler registered for each request's routine id.
///
/// Requests for [`PING_ROUTINE`] are echoed unless a handler is registered.
pub struct RpcWorker<T: Transport> {
    config: RpcWorkerConfig,
    consumer: Mutex<Option<ConsumerHandle>>,
    routines: Routines,
    transport: Arc<T>,
}

impl<T: Transport> RpcWorker<T> {
    /// Creates a worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Construction`] if the operator queue is empty.
    pub fn new(transport: Arc<T>, config: RpcWorkerConfig) -> Result<Self> {
        if config.operator_queue.is_empty() {
            return Err(Error::Construction(
                "operator queue must not be empty".to_string(),
            ));
        }

        Ok(Self {
            config,
            consumer: Mutex::new(None),
            routines: Arc::new(DashMap::new()),
            transport,
        })
    }

    /// Registers `handler` for `routine_id`, replacing any previous one.
    pub fn register(&self, routine_id: impl Into<String>, handler: impl RoutineHandler) {
        self.routines.insert(routine_id.into(), Arc::new(handler));
    }

    /// Starts consuming. Calling this while running returns the existing
    /// consumer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the consumer cannot be opened.
    pub async fn start(&self) -> Result<ConsumerHandle> {
        let mut slot = self.consumer.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let handle = self
            .transport
            .open_consumer(
                Arc::new(RequestDispatcher {
                    routines: self.routines.clone(),
                    transport: self.transport.clone(),
                }),
                ConsumerOptions::default()
                    .queue_name(self.config.operator_queue.clone())
                    .prefetch(self.config.prefetch),
            )
            .await?;

        info!(
            "worker consuming {} ({} routine(s))",
            handle.queue_name,
            self.routines.len()
        );
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Stops consuming. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the cancel fails.
    pub async fn stop(&self) -> Result<()> {
        let handle = self.consumer.lock().await.take();
        if let Some(handle) = handle {
            self.transport.cancel_consumer(&handle).await?;
            info!("worker stopped consuming {}", handle.queue_name);
        }
        Ok(())
    }
}
