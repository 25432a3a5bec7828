//! Cluster membership for masters and workers.
//!
//! A node registers an ephemeral record under its type's subtree, keeps it
//! fresh with periodic heartbeats, and watches the node tree. When another
//! node's record disappears for good, its departure is recorded once and
//! handed to the failover service.
//!
//! ```text
//! /nodes/master/{host}:{port}
//! /nodes/worker[/{group}]/{host}:{port}
//! /dead-servers/{type}_{host}:{port}
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod connection;
mod controller;
mod dead_nodes;
mod error;
mod heartbeat;
mod listener;
mod metrics;
mod resolver;
mod state;

pub use config::{
    DEFAULT_DEAD_MARKER_RETENTION, DEFAULT_DEAD_MARKER_SETTLE_DELAY, DEFAULT_HEARTBEAT_INTERVAL,
    MembershipConfig, RegistrationRetryConfig,
};
pub use connection::ConnectionStateHandler;
pub use controller::{ClusterMembershipController, LocalNode};
pub use dead_nodes::{DeadNodeMarker, DeadNodeMarkers};
pub use error::{Error, Result};
pub use heartbeat::{HeartbeatRecord, HeartbeatReporter, HeartbeatReporterOptions};
pub use listener::NodeEventListener;
pub use metrics::{HostMetrics, StaticMetrics, SystemMetrics};
pub use resolver::{DeadNodeResolver, ResolveOutcome};
pub use state::RegistrationState;
