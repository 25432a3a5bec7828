//! Abstract interface for recovering the work of nodes that left the cluster.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use flowd_registry::NodeType;

/// Marker trait for `FailoverService` errors
pub trait FailoverServiceError: Debug + Error + Send + Sync + 'static {}

/// Reassigns the workflow and task instances owned by a dead node.
///
/// Several masters may observe the same death, so implementations must make
/// recovery idempotent: a second call for a host whose work was already
/// recovered must be harmless.
#[async_trait]
pub trait FailoverService: Send + Sync + 'static {
    /// The error type for failover operations.
    type Error: FailoverServiceError;

    /// Recovers the work owned by the node at `server_host`.
    ///
    /// # Arguments
    /// * `server_host`: Host part of the dead node's address.
    /// * `node_type`: Role the dead node played.
    async fn failover_server_when_down(
        &self,
        server_host: &str,
        node_type: NodeType,
    ) -> Result<(), Self::Error>;
}
