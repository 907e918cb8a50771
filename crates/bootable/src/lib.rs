//! Lifecycle interface for long-running courier components.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for errors raised while starting or stopping a component.
pub trait BootableError: Debug + Error + Send + Sync + 'static {}

/// A component with an explicit start / shutdown lifecycle.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// The error type for lifecycle operations.
    type Error: BootableError;

    /// Name used in lifecycle logs.
    fn bootable_name(&self) -> &str;

    /// Start background work. Calling `start` twice is an error or a no-op,
    /// depending on the component.
    async fn start(&self) -> Result<(), Self::Error>;

    /// Stop background work and release resources.
    async fn shutdown(&self) -> Result<(), Self::Error>;

    /// Wait until background work has exited.
    async fn wait(&self);
}
