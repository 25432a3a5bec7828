//! Error types for the membership subsystem.

use thiserror::Error;

use crate::state::RegistrationState;

/// Membership errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The coordination store rejected an operation
    #[error("Registry error: {0}")]
    Registry(String),

    /// This node never became visible in the registry
    #[error("node {address} not visible in registry after {attempts} attempts")]
    RegistrationTimeout {
        /// Address that was registered.
        address: String,
        /// Attempts made before giving up.
        attempts: usize,
    },

    /// The registry session was lost
    #[error("registry session lost")]
    SessionLost,

    /// `start` was called on a controller that is not unregistered
    #[error("membership controller cannot start from state {0}")]
    AlreadyStarted(RegistrationState),

    /// Illegal registration state transition
    #[error("invalid registration state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: RegistrationState,
        /// Requested state.
        to: RegistrationState,
    },

    /// Heartbeat or marker encoding failed
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for membership operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
