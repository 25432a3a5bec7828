use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Membership error
    #[error(transparent)]
    Membership(#[from] flowd_membership::Error),

    /// Registry error
    #[error(transparent)]
    Registry(#[from] flowd_registry_memory::Error),

    /// Could not set global default subscriber.
    #[error("could not set global default subscriber: {0}")]
    SetTracing(#[from] tracing::dispatcher::SetGlobalDefaultError),

    /// Signal handler error
    #[error("signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}
