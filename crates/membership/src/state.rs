//! Registration state of the local node.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Lifecycle of this node's presence in the registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistrationState {
    /// Not registered yet.
    Unregistered,

    /// Self-registration in progress.
    Registering,

    /// Registered and heartbeating.
    Active,

    /// Registry session suspended; heartbeats keep trying.
    Suspended,

    /// Deliberately removed, or the session was lost. Terminal.
    Deregistered,
}

impl RegistrationState {
    /// Whether heartbeats should be published in this state.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Suspended)
    }

    const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unregistered, Self::Registering)
                | (Self::Registering | Self::Suspended, Self::Active)
                | (Self::Active, Self::Suspended)
                | (
                    Self::Unregistered | Self::Registering | Self::Active | Self::Suspended,
                    Self::Deregistered
                )
        )
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unregistered => "UNREGISTERED",
            Self::Registering => "REGISTERING",
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Deregistered => "DEREGISTERED",
        };
        f.write_str(name)
    }
}

/// Owner of the registration state. Transitions are checked and atomic.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<RegistrationState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(RegistrationState::Unregistered);
        Self { tx }
    }

    pub(crate) fn get(&self) -> RegistrationState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.tx.subscribe()
    }

    /// Moves to `next`, returning the previous state.
    pub(crate) fn transition(&self, next: RegistrationState) -> Result<RegistrationState> {
        let mut previous = RegistrationState::Unregistered;
        let mut allowed = false;

        self.tx.send_if_modified(|current| {
            previous = *current;
            allowed = current.can_transition_to(next);
            if allowed {
                *current = next;
            }
            allowed
        });

        if allowed {
            debug!("Registration state {} -> {}", previous, next);
            Ok(previous)
        } else {
            Err(Error::InvalidTransition {
                from: previous,
                to: next,
            })
        }
    }

    /// Moves to `next` only if the current state is `from`.
    pub(crate) fn transition_from(
        &self,
        from: RegistrationState,
        next: RegistrationState,
    ) -> bool {
        let moved = self.tx.send_if_modified(|current| {
            if *current == from && current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if moved {
            debug!("Registration state {} -> {}", from, next);
        }
        moved
    }
}

/// Raised once when this node can no longer take part in the cluster.
#[derive(Clone, Debug, Default)]
pub(crate) struct FatalSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl FatalSignal {
    pub(crate) fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.reason.set(reason.clone()).is_ok() {
            error!("Membership failure, node leaves the cluster: {}", reason);
        }
        self.token.cancel();
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }
}
