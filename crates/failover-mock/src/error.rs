//! Error types for the mock failover service.

use flowd_failover::FailoverServiceError;
use thiserror::Error;

/// Error type for the mock failover service.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Failure configured through `MockFailoverService::fail_next`.
    #[error("injected failover failure for host {0}")]
    Injected(String),
}

impl FailoverServiceError for Error {}
