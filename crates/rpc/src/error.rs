//! Error types for the RPC engine.

use std::time::Duration;

use courier_bootable::BootableError;
use courier_transport::TransportError;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The task was cancelled before a response arrived.
    #[error("task was cancelled")]
    Cancelled,

    /// Invalid configuration; the object is unusable.
    #[error("invalid configuration: {0}")]
    Construction(String),

    /// Encoding or decoding a JSON body failed.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The responder reported a failure for the request.
    #[error("remote failure: {0}")]
    Remote(String),

    /// No response arrived within the task's deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Publishing or consuming through the transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BootableError for Error {}
