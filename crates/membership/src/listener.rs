//! Routes node-tree notifications to the controller.

use async_trait::async_trait;
use flowd_failover::FailoverService;
use flowd_registry::{EventKind, NodeType, RegistryClient, RegistryEvent, SubscriptionListener, path};
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::controller::ClusterMembershipController;

/// Subscribed to the node tree root; handles each event on its own task.
pub struct NodeEventListener<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    controller: ClusterMembershipController<R, F>,
    tasks: TaskTracker,
}

impl<R, F> NodeEventListener<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    /// Create a listener dispatching to `controller`, spawning on `tasks`.
    pub const fn new(controller: ClusterMembershipController<R, F>, tasks: TaskTracker) -> Self {
        Self { controller, tasks }
    }

    /// Handles one event to completion.
    pub async fn dispatch(controller: &ClusterMembershipController<R, F>, event: RegistryEvent) {
        let Some(node_type) = path::node_type_of(&event.path) else {
            debug!("Ignoring {:?} event outside node subtrees: {}", event.kind, event.path);
            return;
        };

        match (event.kind, node_type) {
            (EventKind::Removed, NodeType::Master) => {
                controller
                    .remove_master_node_path(&event.path, NodeType::Master, true)
                    .await;
            }
            (EventKind::Removed, NodeType::Worker) => {
                controller
                    .remove_worker_node_path(&event.path, NodeType::Worker, true)
                    .await;
            }
            (EventKind::Added, _) => controller.node_added(&event.path, node_type),
            (EventKind::Updated, _) => {}
        }
    }
}

#[async_trait]
impl<R, F> SubscriptionListener for NodeEventListener<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    async fn notify(&self, event: RegistryEvent) {
        let controller = self.controller.clone();
        self.tasks.spawn(async move {
            Self::dispatch(&controller, event).await;
        });
    }
}
