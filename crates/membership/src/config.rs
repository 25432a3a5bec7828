//! Membership configuration types

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;

use flowd_registry::{NodeAddress, NodeType, path};
use tracing::warn;

use crate::error::{Error, Result};

/// Default heartbeat period
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default wait between confirming visibility and clearing our own dead marker
pub const DEFAULT_DEAD_MARKER_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Default time a completed dead marker is kept to absorb redelivered removals
pub const DEFAULT_DEAD_MARKER_RETENTION: Duration = Duration::from_secs(600);

/// Configuration for the self-registration visibility poll
#[derive(Debug, Clone)]
pub struct RegistrationRetryConfig {
    /// Maximum number of visibility checks before giving up (default: 30)
    pub max_attempts: usize,
    /// Delay after the first failed check (default: 1s)
    pub initial_delay: Duration,
    /// Upper bound for the doubling delay (default: 5s)
    pub max_delay: Duration,
}

impl Default for RegistrationRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Configuration for a node's membership in the cluster
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Role of this process.
    pub node_type: NodeType,

    /// Port this process serves on. Forms the node address with the host.
    pub listen_port: u16,

    /// Advertised host. Detected from the outbound interface when unset.
    pub host: Option<String>,

    /// Worker group to register under. Only used by workers.
    pub worker_group: Option<String>,

    /// Additional ports reported in heartbeats.
    pub extra_listen_ports: Vec<u16>,

    /// Heartbeat period. The first heartbeat is published immediately.
    pub heartbeat_interval: Duration,

    /// Load average threshold reported to peers. Not enforced here.
    pub max_cpu_load_avg: f64,

    /// Reserved memory in GB reported to peers. Not enforced here.
    pub reserved_memory: f64,

    /// Self-registration visibility poll.
    pub registration_retry: RegistrationRetryConfig,

    /// Safety margin between confirming visibility and clearing a dead marker
    /// a peer may have recorded for a previous incarnation of this node.
    pub dead_marker_settle_delay: Duration,

    /// How long the marker of a completed failover suppresses duplicate
    /// removal events for the same path.
    pub dead_marker_retention: Duration,

    /// Consecutive heartbeat failures before liveness is reported degraded.
    pub degraded_after_failures: u32,

    /// Upper bound for joining background tasks during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            node_type: NodeType::Master,
            listen_port: 5678,
            host: None,
            worker_group: None,
            extra_listen_ports: Vec::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_cpu_load_avg: num_cpus::get() as f64 * 2.0,
            reserved_memory: 0.3,
            registration_retry: RegistrationRetryConfig::default(),
            dead_marker_settle_delay: DEFAULT_DEAD_MARKER_SETTLE_DELAY,
            dead_marker_retention: DEFAULT_DEAD_MARKER_RETENTION,
            degraded_after_failures: 3,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl MembershipConfig {
    /// Rejects values the controller cannot run with.
    ///
    /// # Errors
    /// Returns `Error::Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Configuration(
                "heartbeat_interval must be positive".to_string(),
            ));
        }

        if self.registration_retry.max_attempts == 0 {
            return Err(Error::Configuration(
                "registration_retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.degraded_after_failures == 0 {
            return Err(Error::Configuration(
                "degraded_after_failures must be at least 1".to_string(),
            ));
        }

        if let Some(group) = &self.worker_group {
            if group.is_empty() || group.contains('/') {
                return Err(Error::Configuration(format!(
                    "invalid worker group '{group}'"
                )));
            }
        }

        Ok(())
    }

    /// This node's `host:port` address.
    #[must_use]
    pub fn node_address(&self) -> NodeAddress {
        let host = self
            .host
            .clone()
            .unwrap_or_else(|| local_ip().to_string());

        NodeAddress::new(host, self.listen_port)
    }

    /// Registry path this node registers at.
    #[must_use]
    pub fn node_path(&self, address: &NodeAddress) -> String {
        match (self.node_type, &self.worker_group) {
            (NodeType::Worker, Some(group)) => path::worker_group_path(group, address),
            (node_type, _) => path::node_path(node_type, address),
        }
    }

    /// Every port reported in heartbeats, listen port first.
    #[must_use]
    pub fn listen_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.listen_port];
        for port in &self.extra_listen_ports {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn local_ip() -> IpAddr {
    let detected = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match detected {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Failed to detect local address, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
