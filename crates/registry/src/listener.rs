use async_trait::async_trait;

use crate::{ConnectionState, RegistryEvent};

/// Receives change notifications for a subscribed subtree.
#[async_trait]
pub trait SubscriptionListener: Send + Sync + 'static {
    /// Called once per delivered event.
    async fn notify(&self, event: RegistryEvent);
}

/// Receives session state transitions.
///
/// The registry awaits each call before reporting the next transition.
#[async_trait]
pub trait ConnectionStateListener: Send + Sync + 'static {
    /// Called on every session state transition.
    async fn on_state_change(&self, state: ConnectionState);
}
