//! The requesting side: publishes requests and routes responses to tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_bootable::Bootable;
use courier_transport::{
    ConsumerHandle, ConsumerOptions, Delivery, DeliveryHandler, Properties, Transport,
    TransportError,
};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{DeliveryMode, RequestOptions, RpcMasterConfig};
use crate::error::{Error, Result};
use crate::info::{InfoCollector, Scope};
use crate::message::{Message, Payload, REQUEST_ID_HEADER, ROUTINE_ID_HEADER};
use crate::monitor::TimeoutMonitor;
use crate::task::{RpcTask, TaskEvent, TaskListener};

type TaskTable = Arc<DashMap<String, Arc<RpcTask>>>;

/// Prefetch of every response consumer.
const PREFETCH: u16 = 1;

/// Routes deliveries to the task registered under their correlation id.
struct ResponseDispatcher {
    tasks: TaskTable,
}

#[async_trait]
impl DeliveryHandler for ResponseDispatcher {
    async fn deliver(&self, delivery: Delivery) -> bool {
        let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
            trace!("delivery on {} has no correlation id, skipped", delivery.queue_name);
            return false;
        };

        // Clone out of the table so no shard lock is held while the task's
        // completion listener removes the entry.
        let Some(task) = self.tasks.get(&correlation_id).map(|entry| entry.value().clone())
        else {
            trace!("task[{}] not found, message skipped", correlation_id);
            return false;
        };

        let pushed = task.push(Message::from(delivery));
        if pushed {
            debug!("message pushed to task[{}]", correlation_id);
        }
        pushed
    }
}

/// Unregisters a finished task and releases its standalone consumer.
struct TaskCompletion<T: Transport> {
    in_flight: Arc<watch::Sender<usize>>,
    standalone: Option<ConsumerHandle>,
    task_tracker: TaskTracker,
    tasks: TaskTable,
    transport: Arc<T>,
}

impl<T: Transport> TaskListener for TaskCompletion<T> {
    fn on_task_event(&self, event: &TaskEvent) {
        self.tasks.remove(&event.correlation_id);

        if let Some(handle) = self.standalone.clone() {
            let transport = self.transport.clone();
            self.task_tracker.spawn(async move {
                if let Err(e) = transport.cancel_consumer(&handle).await {
                    debug!("failed to cancel consumer {}: {}", handle.consumer_tag, e);
                }
            });
        }

        self.in_flight
            .send_modify(|count| *count = count.saturating_sub(1));

        debug!(
            "task[{}] done ({:?}), {} task(s) remaining",
            event.correlation_id,
            event.cause,
            self.tasks.len()
        );
    }
}

/// A request's in-flight slot. Until the request is sent, dropping it
/// cancels the task, or frees the slot directly when no task exists yet.
struct Admission<'a> {
    in_flight: &'a watch::Sender<usize>,
    sent: bool,
    task: Option<Arc<RpcTask>>,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        match self.task.take() {
            // The task's listener frees the slot.
            Some(task) => {
                task.cancel();
            }
            None => self
                .in_flight
                .send_modify(|count| *count = count.saturating_sub(1)),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerInfo {
    channel: String,
    consumer_tag: String,
    queue_name: String,
}

impl From<&ConsumerHandle> for ConsumerInfo {
    fn from(handle: &ConsumerHandle) -> Self {
        Self {
            channel: handle.channel.to_string(),
            consumer_tag: handle.consumer_tag.clone(),
            queue_name: handle.queue_name.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MonitorInfo {
    id: String,
    interval_ms: u128,
    running: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MasterInfo {
    closed: bool,
    instance_id: String,
    response_queue: String,
    timeout_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    monitor: Option<MonitorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_tasks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shared_consumer: Option<ConsumerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_count: Option<usize>,
}

/// Publishes requests and correlates responses back to their tasks.
///
/// Every task is registered before its request is published, so a response
/// can never beat its task into the table. Tasks leave the table exactly once,
/// on completion, timeout or cancellation.
pub struct RpcMaster<T: Transport> {
    closed_token: CancellationToken,
    closing: AtomicBool,
    config: RpcMasterConfig,
    force_cancel: AtomicBool,
    in_flight: Arc<watch::Sender<usize>>,
    monitor: TimeoutMonitor<RpcTask>,
    shared_consumer: Mutex<Option<ConsumerHandle>>,
    task_tracker: TaskTracker,
    tasks: TaskTable,
    transport: Arc<T>,
}

impl<T: Transport> RpcMaster<T> {
    /// Creates a master over `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Construction`] if the configuration is invalid.
    pub fn new(transport: Arc<T>, config: RpcMasterConfig) -> Result<Self> {
        config.validate()?;

        let tasks: TaskTable = Arc::new(DashMap::new());
        let monitor = TimeoutMonitor::new(tasks.clone(), config.monitor_interval, config.timeout)
            .with_id(format!("{}-monitor", config.instance_id));
        let (in_flight, _) = watch::channel(0);

        info!(
            "rpc master {} created, response queue {}",
            config.instance_id, config.response_queue
        );

        Ok(Self {
            closed_token: CancellationToken::new(),
            closing: AtomicBool::new(false),
            config,
            force_cancel: AtomicBool::new(false),
            in_flight: Arc::new(in_flight),
            monitor,
            shared_consumer: Mutex::new(None),
            task_tracker: TaskTracker::new(),
            tasks,
            transport,
        })
    }

    /// The master's configuration.
    #[must_use]
    pub const fn config(&self) -> &RpcMasterConfig {
        &self.config
    }

    /// The underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Publishes a request and returns its task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the master is closed, the response
    /// consumer cannot be opened or the publish fails. A task whose publish
    /// failed is cancelled and unregistered before this returns. Returns
    /// [`Error::Cancelled`] when `close()` gave up waiting while the request
    /// was being registered.
    pub async fn request(
        &self,
        routine_id: Option<&str>,
        payload: impl Into<Payload> + Send,
        options: RequestOptions,
    ) -> Result<Arc<RpcTask>> {
        let Some(mut admission) = self.admit() else {
            return Err(TransportError::Closed.into());
        };

        self.monitor.start();

        let (consumer, standalone) = self.reply_consumer(options.mode).await?;

        let correlation_id = Uuid::new_v4().to_string();
        let request_id = options
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout = options
            .timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(self.config.timeout);

        let task = Arc::new(RpcTask::new(
            correlation_id.clone(),
            request_id,
            routine_id.map(ToString::to_string),
            timeout,
            options.policy,
        ));
        task.set_listener(Arc::new(TaskCompletion {
            in_flight: self.in_flight.clone(),
            standalone,
            task_tracker: self.task_tracker.clone(),
            tasks: self.tasks.clone(),
            transport: self.transport.clone(),
        }));
        admission.task = Some(task.clone());

        self.tasks.insert(correlation_id.clone(), task.clone());
        if self.force_cancel.load(Ordering::SeqCst) {
            task.cancel();
            return Err(Error::Cancelled);
        }

        let mut properties = Properties::default()
            .with_headers(options.headers)
            .with_header(REQUEST_ID_HEADER, task.request_id())
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(consumer.queue_name);
        if let Some(routine_id) = task.routine_id() {
            properties = properties.with_header(ROUTINE_ID_HEADER, routine_id);
        }

        if let Err(e) = self
            .transport
            .publish(payload.into().into_bytes(), properties, None)
            .await
        {
            warn!("failed to publish request {}: {}", correlation_id, e);
            task.cancel();
            return Err(e.into());
        }

        task.mark_sent();
        admission.sent = true;
        debug!(
            "request {} published ({}), routine {:?}",
            correlation_id,
            options.mode,
            task.routine_id()
        );

        Ok(task)
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether a task is registered under `correlation_id`.
    #[must_use]
    pub fn has_task(&self, correlation_id: &str) -> bool {
        self.tasks.contains_key(correlation_id)
    }

    /// The shared response consumer, once the first shared request has
    /// opened it.
    pub async fn shared_consumer(&self) -> Option<ConsumerHandle> {
        self.shared_consumer.lock().await.clone()
    }

    /// Whether `close()` has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Drains outstanding tasks and releases all resources.
    ///
    /// Waits for every registered task to finish (or for the close timeout,
    /// after which remaining tasks are cancelled), sleeps the grace period,
    /// stops the monitor, cancels the shared consumer and closes the
    /// transport. Failures are logged, never returned. Later calls return
    /// immediately.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            self.closed_token.cancelled().await;
            return;
        }

        info!(
            "closing rpc master {}, {} task(s) pending",
            self.config.instance_id,
            self.tasks.len()
        );

        let mut in_flight = self.in_flight.subscribe();
        match self.config.close_timeout {
            None => {
                if let Err(e) = in_flight.wait_for(|count| *count == 0).await {
                    warn!("in-flight counter closed while draining: {}", e);
                }
            }
            Some(limit) => {
                let drained =
                    tokio::time::timeout(limit, in_flight.wait_for(|count| *count == 0))
                        .await
                        .is_ok();
                if !drained {
                    warn!(
                        "{} task(s) still pending after {:?}, cancelling",
                        self.tasks.len(),
                        limit
                    );
                    self.force_cancel.store(true, Ordering::SeqCst);
                    self.cancel_pending();
                }
            }
        }

        if !self.config.grace_period.is_zero() {
            tokio::time::sleep(self.config.grace_period).await;
        }

        self.monitor.stop().await;

        let shared = self.shared_consumer.lock().await.take();
        if let Some(handle) = shared {
            if let Err(e) = self.transport.cancel_consumer(&handle).await {
                warn!("failed to cancel shared consumer: {}", e);
            }
        }

        self.task_tracker.close();
        self.task_tracker.wait().await;

        if let Err(e) = self.transport.close().await {
            warn!("failed to close transport: {}", e);
        }

        self.closed_token.cancel();
        info!("rpc master {} closed", self.config.instance_id);
    }

    /// Counts a request in flight unless `close()` has begun.
    fn admit(&self) -> Option<Admission<'_>> {
        let admitted = self.in_flight.send_if_modified(|count| {
            if self.closing.load(Ordering::SeqCst) {
                return false;
            }
            *count += 1;
            true
        });

        admitted.then(|| Admission {
            in_flight: &self.in_flight,
            sent: false,
            task: None,
        })
    }

    async fn reply_consumer(
        &self,
        mode: DeliveryMode,
    ) -> Result<(ConsumerHandle, Option<ConsumerHandle>)> {
        match mode {
            DeliveryMode::Shared => Ok((self.ensure_shared_consumer().await?, None)),
            DeliveryMode::Standalone => {
                let handle = self
                    .transport
                    .open_consumer(
                        self.dispatcher(),
                        ConsumerOptions::default()
                            .binding(false)
                            .prefetch(PREFETCH)
                            .force_new_channel(false),
                    )
                    .await?;
                Ok((handle.clone(), Some(handle)))
            }
        }
    }

    fn cancel_pending(&self) {
        let pending: Vec<Arc<RpcTask>> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for task in pending {
            task.cancel();
        }
    }

    fn dispatcher(&self) -> Arc<dyn DeliveryHandler> {
        Arc::new(ResponseDispatcher {
            tasks: self.tasks.clone(),
        })
    }

    async fn ensure_shared_consumer(&self) -> Result<ConsumerHandle> {
        let mut slot = self.shared_consumer.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let handle = self
            .transport
            .open_consumer(
                self.dispatcher(),
                ConsumerOptions::default()
                    .queue_name(self.config.response_queue.clone())
                    .binding(false)
                    .prefetch(PREFETCH)
                    .force_new_channel(false),
            )
            .await?;

        info!(
            "shared consumer {} opened on {}",
            handle.consumer_tag, handle.queue_name
        );
        *slot = Some(handle.clone());
        Ok(handle)
    }
}

impl<T: Transport> InfoCollector for RpcMaster<T> {
    fn collect(&self, scope: Scope) -> serde_json::Value {
        let mut info = MasterInfo {
            closed: self.is_closed(),
            instance_id: self.config.instance_id.clone(),
            response_queue: self.config.response_queue.clone(),
            timeout_ms: self.config.timeout.as_millis(),
            monitor: None,
            pending_tasks: None,
            shared_consumer: None,
            task_count: None,
        };

        if scope == Scope::Full {
            info.monitor = Some(MonitorInfo {
                id: self.monitor.monitor_id().to_string(),
                interval_ms: self.monitor.interval().as_millis(),
                running: self.monitor.is_running(),
            });
            info.pending_tasks = Some(self.tasks.iter().map(|entry| entry.key().clone()).collect());
            info.shared_consumer = self
                .shared_consumer
                .try_lock()
                .ok()
                .and_then(|slot| slot.as_ref().map(ConsumerInfo::from));
            info.task_count = Some(self.tasks.len());
        }

        serde_json::to_value(info).unwrap_or_default()
    }
}

#[async_trait]
impl<T: Transport> Bootable for RpcMaster<T> {
    type Error = Error;

    fn bootable_name(&self) -> &str {
        &self.config.instance_id
    }

    async fn start(&self) -> Result<()> {
        if !self.is_closed() {
            self.monitor.start();
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.close().await;
        Ok(())
    }

    async fn wait(&self) {
        self.closed_token.cancelled().await;
    }
}
