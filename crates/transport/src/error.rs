use thiserror::Error;

/// Errors raised by transport implementations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The channel backing a consumer or publisher went away.
    #[error("channel closed")]
    ChannelClosed,

    /// The transport has been closed.
    #[error("transport is closed")]
    Closed,

    /// Opening a consumer failed.
    #[error("consume failed: {0}")]
    Consume(String),

    /// Publishing a message failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The named queue does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(String),
}
