//! Liveness probing through the request path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::Transport;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout_at};
use tracing::debug;
use uuid::Uuid;

use crate::config::{DeliveryMode, RequestOptions};
use crate::error::{Error, Result};
use crate::master::RpcMaster;
use crate::message::Message;

/// Routine id answered by workers for liveness probes.
pub const PING_ROUTINE: &str = "courier.ping";

/// Default probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const SUMMARY_OK: &str = "The connection is ok";
const SUMMARY_FAILED: &str = "The workers have not been started or the parameters mismatched";

/// A probe request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    /// Unique id echoed back by the responder.
    pub probe_id: String,
}

impl Default for Ping {
    fn default() -> Self {
        Self {
            probe_id: Uuid::new_v4().to_string(),
        }
    }
}

/// A probe reply.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Pong {
    /// The reply body: decoded JSON, or the raw text when it is not JSON.
    pub payload: serde_json::Value,
}

impl Pong {
    /// Builds a pong from a response message.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        let payload = message.json().unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(message.payload()).into_owned())
        });
        Self { payload }
    }
}

/// Sends a probe and waits for its reply.
#[async_trait]
pub trait RpcChecker: Send + Sync {
    /// Sends `ping` and returns the reply.
    async fn send(&self, ping: Ping) -> Result<Pong>;
}

/// Outcome of a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// The probe round-tripped.
    Ok,
    /// The probe failed.
    Failed,
}

/// Serializable probe result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckReport {
    /// Probe outcome.
    pub status: CheckStatus,
    /// Human-readable summary.
    pub summary: String,
    /// Error detail on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reply body on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong: Option<serde_json::Value>,
    /// Basic snapshot of the probed master.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl CheckReport {
    /// A successful report.
    #[must_use]
    pub fn ok(pong: Pong) -> Self {
        Self {
            status: CheckStatus::Ok,
            summary: SUMMARY_OK.to_string(),
            error: None,
            pong: Some(pong.payload),
            info: None,
        }
    }

    /// A failed report.
    #[must_use]
    pub fn failed(error: &Error) -> Self {
        Self {
            status: CheckStatus::Failed,
            summary: SUMMARY_FAILED.to_string(),
            error: Some(error.to_string()),
            pong: None,
            info: None,
        }
    }

    /// Attaches a snapshot of the probed master.
    #[must_use]
    pub fn with_info(mut self, info: serde_json::Value) -> Self {
        self.info = Some(info);
        self
    }

    /// Whether the probe succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == CheckStatus::Ok
    }
}

/// Runs one probe and folds the result into a report.
pub async fn run_check<C: RpcChecker + ?Sized>(checker: &C) -> CheckReport {
    match checker.send(Ping::default()).await {
        Ok(pong) => CheckReport::ok(pong),
        Err(e) => {
            debug!("probe failed: {}", e);
            CheckReport::failed(&e)
        }
    }
}

/// Probes workers by sending [`PING_ROUTINE`] requests through a master.
pub struct MasterChecker<T: Transport> {
    master: Arc<RpcMaster<T>>,
    mode: DeliveryMode,
    timeout: Duration,
}

impl<T: Transport> MasterChecker<T> {
    /// Creates a checker with the default probe timeout.
    #[must_use]
    pub const fn new(master: Arc<RpcMaster<T>>) -> Self {
        Self {
            master,
            mode: DeliveryMode::Shared,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Set the probe timeout. Zero falls back to [`DEFAULT_PROBE_TIMEOUT`].
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            DEFAULT_PROBE_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// The effective probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the delivery mode used for probes.
    #[must_use]
    pub const fn mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// The master being probed.
    #[must_use]
    pub const fn master(&self) -> &Arc<RpcMaster<T>> {
        &self.master
    }
}

#[async_trait]
impl<T: Transport> RpcChecker for MasterChecker<T> {
    async fn send(&self, ping: Ping) -> Result<Pong> {
        let deadline = Instant::now() + self.timeout;
        let body = Bytes::from(serde_json::to_vec(&ping)?);

        let task = timeout_at(
            deadline,
            self.master.request(
                Some(PING_ROUTINE),
                body,
                RequestOptions::default()
                    .mode(self.mode)
                    .timeout(self.timeout),
            ),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;

        let Ok(response) = timeout_at(deadline, task.response()).await else {
            task.cancel();
            return Err(Error::Timeout(self.timeout));
        };
        let message = response?;
        if message.is_failed() {
            return Err(Error::Remote(
                String::from_utf8_lossy(message.payload()).into_owned(),
            ));
        }

        Ok(Pong::from_message(&message))
    }
}
