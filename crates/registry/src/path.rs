//! Registry key layout.
//!
//! ```text
//! /nodes/master/<host:port>
//! /nodes/worker/<host:port>
//! /nodes/worker/<group>/<host:port>
//! /dead-servers/<master|worker>_<host:port>
//! ```

use crate::{NodeAddress, NodeType};

/// Root of the node tree watched by every master.
pub const NODES_ROOT: &str = "/nodes";

/// Subtree of registered masters.
pub const MASTERS_ROOT: &str = "/nodes/master";

/// Subtree of registered workers.
pub const WORKERS_ROOT: &str = "/nodes/worker";

/// Subtree of persisted dead-node markers.
pub const DEAD_SERVERS_ROOT: &str = "/dead-servers";

/// Registry path of a node.
#[must_use]
pub fn node_path(node_type: NodeType, address: &NodeAddress) -> String {
    format!("{}/{address}", node_type.registry_root())
}

/// Registry path of a worker inside a worker group.
#[must_use]
pub fn worker_group_path(group: &str, address: &NodeAddress) -> String {
    format!("{WORKERS_ROOT}/{group}/{address}")
}

/// Registry path of the dead-node marker for a node path.
///
/// Returns `None` when the node path does not end in a `host:port` segment.
#[must_use]
pub fn dead_marker_path(node_type: NodeType, node_path: &str) -> Option<String> {
    let address = address_of(node_path)?;
    Some(format!(
        "{DEAD_SERVERS_ROOT}/{}_{address}",
        node_type.dead_marker_prefix()
    ))
}

/// Node type owning a path, judged by its subtree.
#[must_use]
pub fn node_type_of(path: &str) -> Option<NodeType> {
    [NodeType::Master, NodeType::Worker]
        .into_iter()
        .find(|node_type| is_child_of(path, node_type.registry_root()))
}

/// Parses the `host:port` last segment of a path.
#[must_use]
pub fn address_of(path: &str) -> Option<NodeAddress> {
    let segment = path.rsplit('/').next()?;
    segment.parse().ok()
}

/// Host of the node identified by a path.
#[must_use]
pub fn host_of(path: &str) -> Option<String> {
    address_of(path).map(|address| address.host().to_string())
}

/// Whether `path` lies strictly below `root`.
#[must_use]
pub fn is_child_of(path: &str, root: &str) -> bool {
    path.strip_prefix(root)
        .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'))
}
