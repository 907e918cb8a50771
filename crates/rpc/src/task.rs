//! A single in-flight request and its response lifecycle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::monitor::Timeoutable;

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    /// Created but not yet published.
    Created,
    /// Published, waiting for responses.
    AwaitingResponse,
    /// The final response arrived.
    Completed,
    /// No response within the deadline.
    TimedOut,
    /// Cancelled by the caller or the master.
    Cancelled,
    /// Completion has been dispatched to the listener.
    Closed,
}

/// Why a task finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionCause {
    /// The final response arrived.
    Completed,
    /// No response within the deadline.
    TimedOut,
    /// Cancelled before completion.
    Cancelled,
}

impl From<CompletionCause> for TaskState {
    fn from(cause: CompletionCause) -> Self {
        match cause {
            CompletionCause::Completed => Self::Completed,
            CompletionCause::TimedOut => Self::TimedOut,
            CompletionCause::Cancelled => Self::Cancelled,
        }
    }
}

/// How many responses a task accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponsePolicy {
    /// The first response completes the task.
    #[default]
    Single,
    /// Responses accumulate until one carries a `completed` or `failed` status.
    Streaming,
}

/// Completion notification delivered to a [`TaskListener`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskEvent {
    /// Why the task finished.
    pub cause: CompletionCause,
    /// Correlation id of the task.
    pub correlation_id: String,
    /// Request id of the task.
    pub request_id: String,
    /// Routine id of the task, if any.
    pub routine_id: Option<String>,
}

/// Receives exactly one event per task, when the task finishes.
pub trait TaskListener: Send + Sync + 'static {
    /// Handles a task's completion.
    fn on_task_event(&self, event: &TaskEvent);
}

#[derive(Debug)]
struct Inner {
    cause: Option<CompletionCause>,
    last_activity: Instant,
    pending: VecDeque<Message>,
    received: Vec<Message>,
    state: TaskState,
}

/// An in-flight request, keyed by its correlation id.
///
/// Callers consume responses with [`next`](Self::next),
/// [`response`](Self::response) or [`messages`](Self::messages); all of them
/// observe the deadline even when no monitor is running.
pub struct RpcTask {
    correlation_id: String,
    created_at: Instant,
    events: watch::Sender<u64>,
    inner: Mutex<Inner>,
    listener: Mutex<Option<Arc<dyn TaskListener>>>,
    policy: ResponsePolicy,
    request_id: String,
    routine_id: Option<String>,
    timeout: Duration,
}

impl RpcTask {
    pub(crate) fn new(
        correlation_id: String,
        request_id: String,
        routine_id: Option<String>,
        timeout: Duration,
        policy: ResponsePolicy,
    ) -> Self {
        let now = Instant::now();
        let (events, _) = watch::channel(0);

        Self {
            correlation_id,
            created_at: now,
            events,
            inner: Mutex::new(Inner {
                cause: None,
                last_activity: now,
                pending: VecDeque::new(),
                received: Vec::new(),
                state: TaskState::Created,
            }),
            listener: Mutex::new(None),
            policy,
            request_id,
            routine_id,
            timeout,
        }
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn TaskListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub(crate) fn mark_sent(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TaskState::Created {
            inner.state = TaskState::AwaitingResponse;
        }
    }

    /// The correlation id, unique per master.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The request id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The routine id.
    #[must_use]
    pub fn routine_id(&self) -> Option<&str> {
        self.routine_id.as_deref()
    }

    /// When the task was created.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The effective timeout. Zero means the task never times out.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The response policy.
    #[must_use]
    pub const fn policy(&self) -> ResponsePolicy {
        self.policy
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Why the task finished, once it has.
    #[must_use]
    pub fn outcome(&self) -> Option<CompletionCause> {
        self.inner.lock().cause
    }

    /// Whether the task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }

    /// Number of responses accepted so far.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.lock().received.len()
    }

    /// Offers a response to the task. Returns `false` if the task has
    /// already finished and the message was discarded.
    pub fn push(&self, message: Message) -> bool {
        let completed = {
            let mut inner = self.inner.lock();
            if inner.cause.is_some() {
                trace!("task[{}] finished, message discarded", self.correlation_id);
                return false;
            }

            let terminal = match self.policy {
                ResponsePolicy::Single => true,
                ResponsePolicy::Streaming => message.is_terminal(),
            };

            inner.last_activity = Instant::now();
            inner.pending.push_back(message.clone());
            inner.received.push(message);
            if inner.state == TaskState::Created {
                inner.state = TaskState::AwaitingResponse;
            }

            terminal && Self::transition(&mut inner, CompletionCause::Completed)
        };

        self.bump();
        if completed {
            self.dispatch(CompletionCause::Completed);
        }
        true
    }

    /// Cancels the task. Returns `false` if it had already finished.
    pub fn cancel(&self) -> bool {
        self.conclude(CompletionCause::Cancelled, |_| true)
    }

    /// Waits for the next response. Returns `Ok(None)` once the task has
    /// completed and every response has been taken.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Cancelled`] if the task ended
    /// that way and no responses remain.
    pub async fn next(&self) -> Result<Option<Message>> {
        self.settle(|inner, timeout| {
            if let Some(message) = inner.pending.pop_front() {
                return Some(Ok(Some(message)));
            }
            Self::outcome_result(inner.cause, timeout).map(|result| result.map(|()| None))
        })
        .await
    }

    /// Waits for completion and returns the final response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Cancelled`] if the task did not
    /// complete.
    pub async fn response(&self) -> Result<Message> {
        self.messages().await?.pop().ok_or(Error::Cancelled)
    }

    /// Waits for completion and returns every response in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::Cancelled`] if the task did not
    /// complete.
    pub async fn messages(&self) -> Result<Vec<Message>> {
        self.settle(|inner, timeout| {
            Self::outcome_result(inner.cause, timeout)
                .map(|result| result.map(|()| inner.received.clone()))
        })
        .await
    }

    async fn settle<R>(
        &self,
        mut extract: impl FnMut(&mut Inner, Duration) -> Option<Result<R>>,
    ) -> Result<R> {
        let mut events = self.events.subscribe();

        loop {
            let deadline = {
                let mut inner = self.inner.lock();
                if let Some(result) = extract(&mut *inner, self.timeout) {
                    return result;
                }
                self.deadline(inner.last_activity)
            };

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, events.changed())
                        .await
                        .is_err()
                    {
                        self.expire_if_idle();
                    }
                }
                None => {
                    let _ = events.changed().await;
                }
            }
        }
    }

    fn outcome_result(cause: Option<CompletionCause>, timeout: Duration) -> Option<Result<()>> {
        match cause? {
            CompletionCause::Completed => Some(Ok(())),
            CompletionCause::TimedOut => Some(Err(Error::Timeout(timeout))),
            CompletionCause::Cancelled => Some(Err(Error::Cancelled)),
        }
    }

    fn deadline(&self, last_activity: Instant) -> Option<Instant> {
        (!self.timeout.is_zero()).then(|| last_activity + self.timeout)
    }

    fn expire_if_idle(&self) -> bool {
        self.conclude(CompletionCause::TimedOut, |inner| {
            self.deadline(inner.last_activity)
                .is_some_and(|deadline| Instant::now() >= deadline)
        })
    }

    fn conclude(&self, cause: CompletionCause, guard: impl FnOnce(&Inner) -> bool) -> bool {
        let concluded = {
            let mut inner = self.inner.lock();
            inner.cause.is_none() && guard(&*inner) && Self::transition(&mut inner, cause)
        };

        if concluded {
            self.bump();
            self.dispatch(cause);
        }
        concluded
    }

    fn transition(inner: &mut Inner, cause: CompletionCause) -> bool {
        if inner.cause.is_some() {
            return false;
        }
        inner.cause = Some(cause);
        inner.state = cause.into();
        true
    }

    fn dispatch(&self, cause: CompletionCause) {
        debug!("task[{}] finished: {:?}", self.correlation_id, cause);

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.on_task_event(&TaskEvent {
                cause,
                correlation_id: self.correlation_id.clone(),
                request_id: self.request_id.clone(),
                routine_id: self.routine_id.clone(),
            });
        }

        self.inner.lock().state = TaskState::Closed;
        self.bump();
    }

    fn bump(&self) {
        self.events.send_modify(|version| *version = version.wrapping_add(1));
    }
}

impl Timeoutable for RpcTask {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timestamp(&self) -> Instant {
        self.inner.lock().last_activity
    }

    fn raise_timeout(&self) {
        self.conclude(CompletionCause::TimedOut, |_| true);
    }
}

impl std::fmt::Debug for RpcTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTask")
            .field("correlation_id", &self.correlation_id)
            .field("request_id", &self.request_id)
            .field("routine_id", &self.routine_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
