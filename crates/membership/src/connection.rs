//! Keeps this node's registration consistent across session disruptions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowd_registry::{ConnectionState, ConnectionStateListener, RegistryClient};
use tracing::{error, info, warn};

use crate::heartbeat::{HeartbeatReporter, HeartbeatSchedule};
use crate::state::{FatalSignal, RegistrationState, StateCell};

/// Reacts to registry session transitions.
pub struct ConnectionStateHandler<R>
where
    R: RegistryClient,
{
    reporter: Arc<HeartbeatReporter<R>>,
    state: Arc<StateCell>,
    heartbeat: Arc<HeartbeatSchedule>,
    fatal: FatalSignal,
    shutdown_timeout: Duration,
}

impl<R> ConnectionStateHandler<R>
where
    R: RegistryClient,
{
    pub(crate) const fn new(
        reporter: Arc<HeartbeatReporter<R>>,
        state: Arc<StateCell>,
        heartbeat: Arc<HeartbeatSchedule>,
        fatal: FatalSignal,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            reporter,
            state,
            heartbeat,
            fatal,
            shutdown_timeout,
        }
    }

    fn suspended(&self) {
        if self
            .state
            .transition_from(RegistrationState::Active, RegistrationState::Suspended)
        {
            warn!(
                "Registry session suspended, {} keeps heartbeating",
                self.reporter.node_path()
            );
        } else {
            warn!("Registry session suspended in state {}", self.state.get());
        }
    }

    async fn reconnected(&self) {
        let current = self.state.get();
        if !current.is_live() {
            info!("Registry session reconnected in state {}, nothing to restore", current);
            return;
        }

        match self.reporter.republish().await {
            Ok(()) => {
                self.state
                    .transition_from(RegistrationState::Suspended, RegistrationState::Active);
                info!(
                    "Registry session reconnected, restored {}",
                    self.reporter.node_path()
                );
            }
            Err(e) => error!(
                "Failed to restore {} after reconnect, next heartbeat will retry: {}",
                self.reporter.node_path(),
                e
            ),
        }
    }

    async fn lost(&self) {
        error!(
            "Registry session lost, {} stops heartbeating",
            self.reporter.node_path()
        );

        self.heartbeat.stop(self.shutdown_timeout).await;
        if let Err(e) = self.state.transition(RegistrationState::Deregistered) {
            warn!("Registry session lost: {}", e);
        }
        self.fatal.trigger(format!(
            "registry session lost for {}",
            self.reporter.node_path()
        ));
    }
}

#[async_trait]
impl<R> ConnectionStateListener for ConnectionStateHandler<R>
where
    R: RegistryClient,
{
    async fn on_state_change(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => info!("Registry session connected"),
            ConnectionState::Suspended => self.suspended(),
            ConnectionState::Reconnected => self.reconnected().await,
            ConnectionState::Lost => self.lost().await,
        }
    }
}
