//! Confirms node departures and hands confirmed ones to failover.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use flowd_failover::FailoverService;
use flowd_registry::{NodeAddress, NodeType, RegistryClient, path};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::dead_nodes::DeadNodeMarkers;

/// What handling a removal event amounted to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolveOutcome {
    /// Empty path or no parsable host; dropped.
    Malformed,
    /// The path belongs to this node; dropped.
    OwnNode,
    /// The path exists again; the removal was transient.
    StillPresent,
    /// The existence check or marker write failed; dropped.
    RegistryUnavailable,
    /// A marker already existed; another event handled this departure.
    AlreadyHandled,
    /// Departure recorded, failover not requested for this event.
    Recorded,
    /// Departure recorded and failover completed.
    FailedOver,
    /// Departure recorded but the failover call failed.
    FailoverFailed,
}

impl fmt::Display for ResolveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Handles node-removal notifications.
///
/// Removals of the same path are handled one at a time; different paths are
/// handled concurrently.
pub struct DeadNodeResolver<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    registry: Arc<R>,
    failover: Arc<F>,
    markers: Arc<DeadNodeMarkers<R>>,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<R, F> DeadNodeResolver<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    /// Create a new resolver
    pub fn new(registry: Arc<R>, failover: Arc<F>, markers: Arc<DeadNodeMarkers<R>>) -> Self {
        Self {
            registry,
            failover,
            markers,
            path_locks: DashMap::new(),
        }
    }

    /// Marker map shared with the controller.
    pub fn markers(&self) -> &Arc<DeadNodeMarkers<R>> {
        &self.markers
    }

    /// Handles the removal of `node_path`.
    ///
    /// `own_address` is this node's address; removals of it never fail over.
    pub async fn resolve(
        &self,
        node_path: &str,
        node_type: NodeType,
        failover: bool,
        own_address: Option<&NodeAddress>,
    ) -> ResolveOutcome {
        info!("{} node deleted: {}", node_type, node_path);

        if node_path.is_empty() {
            error!("Server down error: empty path, nodeType: {}", node_type);
            return ResolveOutcome::Malformed;
        }

        let Some(server_host) = self.registry.get_host_by_event_data_path(node_path) else {
            error!(
                "Server down error: unknown path: {}, nodeType: {}",
                node_path, node_type
            );
            return ResolveOutcome::Malformed;
        };

        if own_address.is_some_and(|own| path::address_of(node_path).as_ref() == Some(own)) {
            warn!(
                "Ignoring removal of own path {}; heartbeats will restore it",
                node_path
            );
            return ResolveOutcome::OwnNode;
        }

        let lock = self
            .path_locks
            .entry(node_path.to_string())
            .or_default()
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.resolve_departure(node_path, node_type, failover, &server_host)
                .await
        };

        // Last handler for this path drops the lock entry
        drop(lock);
        self.path_locks
            .remove_if(node_path, |_, lock| Arc::strong_count(lock) == 1);

        outcome
    }

    async fn resolve_departure(
        &self,
        node_path: &str,
        node_type: NodeType,
        failover: bool,
        server_host: &str,
    ) -> ResolveOutcome {
        match self.registry.exists(node_path).await {
            Ok(true) => {
                info!("Path {} exists again, skipping failover", node_path);
                return ResolveOutcome::StillPresent;
            }
            Ok(false) => debug!("Path {} confirmed absent", node_path),
            Err(e) => {
                error!(
                    "{} server {} existence check failed for {}: {}",
                    node_type, server_host, node_path, e
                );
                return ResolveOutcome::RegistryUnavailable;
            }
        }

        match self.markers.mark(node_path, node_type).await {
            Ok(true) => {}
            Ok(false) => return ResolveOutcome::AlreadyHandled,
            Err(e) => {
                error!(
                    "{} server {} dead marker failed for {}: {}",
                    node_type, server_host, node_path, e
                );
                return ResolveOutcome::RegistryUnavailable;
            }
        }

        if !failover {
            return ResolveOutcome::Recorded;
        }

        match self
            .failover
            .failover_server_when_down(server_host, node_type)
            .await
        {
            Ok(()) => {
                self.markers.complete(node_path);
                info!("{} server failover done, host: {}", node_type, server_host);
                ResolveOutcome::FailedOver
            }
            Err(e) => {
                self.markers.release(node_path);
                error!(
                    "{} server failover failed, host: {}: {}",
                    node_type, server_host, e
                );
                ResolveOutcome::FailoverFailed
            }
        }
    }
}
