//! Configuration for masters, requests and pubsub handlers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use courier_transport::Headers;
use serde::Serialize;

use crate::error::Error;
use crate::task::ResponsePolicy;

/// Default response queue for shared-mode requests.
pub const DEFAULT_RESPONSE_QUEUE: &str = "courier.responses";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout monitor interval.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Where a request's responses are consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// One long-lived consumer on the master's response queue, shared by all
    /// shared-mode requests.
    #[default]
    Shared,
    /// A fresh consumer on an exclusive queue, cancelled when the task ends.
    Standalone,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Standalone => write!(f, "standalone"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "standalone" => Ok(Self::Standalone),
            other => Err(Error::Construction(format!("unknown delivery mode: {other}"))),
        }
    }
}

/// Per-request options.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Extra headers published with the request.
    pub headers: Headers,
    /// Response consumption mode.
    pub mode: DeliveryMode,
    /// Response policy.
    pub policy: ResponsePolicy,
    /// Caller-supplied request id; generated when absent.
    pub request_id: Option<String>,
    /// Task timeout; the master default applies when absent or zero.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Consume responses on a standalone consumer.
    #[must_use]
    pub const fn standalone(mut self) -> Self {
        self.mode = DeliveryMode::Standalone;
        self
    }

    /// Set the delivery mode.
    #[must_use]
    pub const fn mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Accept streamed responses.
    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.policy = ResponsePolicy::Streaming;
        self
    }

    /// Set the request id.
    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set the task timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Configuration for an [`RpcMaster`](crate::RpcMaster).
#[derive(Clone, Debug)]
pub struct RpcMasterConfig {
    /// Force-cancel tasks still pending this long into `close()`.
    /// `None` waits indefinitely.
    pub close_timeout: Option<Duration>,
    /// Extra time `close()` waits after the last task finished.
    pub grace_period: Duration,
    /// Identifier used in logs and info snapshots.
    pub instance_id: String,
    /// Timeout monitor interval. Zero disables the monitor.
    pub monitor_interval: Duration,
    /// Queue consumed by the shared response consumer.
    pub response_queue: String,
    /// Timeout for requests that do not set one. Zero means never.
    pub timeout: Duration,
}

impl Default for RpcMasterConfig {
    fn default() -> Self {
        Self {
            close_timeout: None,
            grace_period: Duration::ZERO,
            instance_id: uuid::Uuid::new_v4().to_string(),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            response_queue: DEFAULT_RESPONSE_QUEUE.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RpcMasterConfig {
    /// Set the close timeout.
    #[must_use]
    pub const fn close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = Some(close_timeout);
        self
    }

    /// Set the close grace period.
    #[must_use]
    pub const fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Set the instance id.
    #[must_use]
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Set the monitor interval.
    #[must_use]
    pub const fn monitor_interval(mut self, monitor_interval: Duration) -> Self {
        self.monitor_interval = monitor_interval;
        self
    }

    /// Set the response queue.
    #[must_use]
    pub fn response_queue(mut self, response_queue: impl Into<String>) -> Self {
        self.response_queue = response_queue.into();
        self
    }

    /// Set the default timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.response_queue.is_empty() {
            return Err(Error::Construction(
                "response queue must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`PubsubHandler`](crate::PubsubHandler).
#[derive(Clone, Debug)]
pub struct PubsubConfig {
    /// Per-subscription prefetch. Zero means unlimited.
    pub prefetch: u16,
    /// Queue consumed by subscriptions; a generated queue when absent.
    pub subscriber_name: Option<String>,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            subscriber_name: None,
        }
    }
}

impl PubsubConfig {
    /// Set the subscriber queue name.
    #[must_use]
    pub fn subscriber_name(mut self, subscriber_name: impl Into<String>) -> Self {
        self.subscriber_name = Some(subscriber_name.into());
        self
    }

    /// Set the prefetch.
    #[must_use]
    pub const fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }
}

/// Configuration for an [`RpcWorker`](crate::RpcWorker).
#[derive(Clone, Debug)]
pub struct RpcWorkerConfig {
    /// Queue the worker consumes requests from.
    pub operator_queue: String,
    /// Per-consumer prefetch. Zero means unlimited.
    pub prefetch: u16,
}

impl RpcWorkerConfig {
    /// Creates a worker config for `operator_queue`.
    pub fn new(operator_queue: impl Into<String>) -> Self {
        Self {
            operator_queue: operator_queue.into(),
            prefetch: 1,
        }
    }

    /// Set the prefetch.
    #[must_use]
    pub const fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }
}
