//! Lifecycle interface shared by long-running cluster services.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;

/// Boxed error returned by lifecycle hooks.
pub type BootableError = Box<dyn std::error::Error + Send + Sync>;

/// A service that can be started, shut down, and waited on.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Name used in lifecycle logs.
    fn bootable_name(&self) -> &str;

    /// Start the service. Returns once the service is ready to serve.
    async fn start(&self) -> Result<(), BootableError>;

    /// Shut the service down. Implementations should release everything they
    /// acquired in `start`, even when an individual step fails.
    async fn shutdown(&self) -> Result<(), BootableError>;

    /// Resolve once the service has stopped, either through `shutdown` or
    /// because it can no longer operate.
    async fn wait(&self);
}
