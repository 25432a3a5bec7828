use flowd_registry::{RegistryClientError, RegistryClientErrorKind};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The session is suspended or lost.
    #[error("session is {0}")]
    Connection(&'static str),

    /// The client was closed.
    #[error("registry client is closed")]
    Closed,

    /// A fault injected through [`crate::MemoryRegistry::fail_writes`].
    #[error("injected fault writing '{0}'")]
    Injected(String),
}

impl RegistryClientError for Error {
    fn kind(&self) -> RegistryClientErrorKind {
        match self {
            Self::Connection(_) => RegistryClientErrorKind::Connection,
            Self::Closed => RegistryClientErrorKind::Closed,
            Self::Injected(_) => RegistryClientErrorKind::Other,
        }
    }
}
