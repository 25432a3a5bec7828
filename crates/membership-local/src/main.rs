//! Binary to run a single membership node against an in-process registry.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod error;

use error::Result;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use flowd_bootable::Bootable;
use flowd_failover_mock::MockFailoverService;
use flowd_membership::{ClusterMembershipController, MembershipConfig};
use flowd_registry::{NodeAddress, NodeType, RegistryClient, path};
use flowd_registry_memory::MemoryRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    Master,
    Worker,
}

impl From<Role> for NodeType {
    fn from(role: Role) -> Self {
        match role {
            Role::Master => Self::Master,
            Role::Worker => Self::Worker,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Role of this node
    #[arg(long, value_enum, default_value_t = Role::Master, env = "FLOWD_NODE_TYPE")]
    node_type: Role,

    /// Port this node serves on
    #[arg(long, default_value_t = 5678, env = "FLOWD_LISTEN_PORT")]
    port: u16,

    /// Advertised host, detected when unset
    #[arg(long, env = "FLOWD_HOST")]
    host: Option<String>,

    /// Worker group to register under
    #[arg(long, env = "FLOWD_WORKER_GROUP")]
    worker_group: Option<String>,

    /// Heartbeat period in seconds
    #[arg(long, default_value_t = 10, env = "FLOWD_HEARTBEAT_INTERVAL")]
    heartbeat_interval_secs: u64,

    /// Load average threshold reported in heartbeats
    #[arg(long, env = "FLOWD_MAX_CPU_LOAD_AVG")]
    max_cpu_load_avg: Option<f64>,

    /// Reserved memory in GB reported in heartbeats
    #[arg(long, default_value_t = 0.3, env = "FLOWD_RESERVED_MEMORY")]
    reserved_memory: f64,

    /// Register a peer worker that leaves after this many seconds
    #[arg(long)]
    simulate_peer_exit_secs: Option<u64>,

    /// Log level
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

impl Args {
    fn membership_config(&self) -> MembershipConfig {
        let defaults = MembershipConfig::default();

        MembershipConfig {
            node_type: self.node_type.into(),
            listen_port: self.port,
            host: self.host.clone(),
            worker_group: self.worker_group.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            max_cpu_load_avg: self.max_cpu_load_avg.unwrap_or(defaults.max_cpu_load_avg),
            reserved_memory: self.reserved_memory,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(args.log_level)
            .finish(),
    )?;

    let registry = MemoryRegistry::new();
    let failover = MockFailoverService::new();
    let controller = ClusterMembershipController::new(
        args.membership_config(),
        Arc::new(registry.clone()),
        Arc::new(failover.clone()),
    );

    controller.start().await?;
    if let Some(node) = controller.local_node() {
        info!("{} node {} joined the cluster", node.node_type, node.address);
    }

    let peer_shutdown = CancellationToken::new();
    if let Some(secs) = args.simulate_peer_exit_secs {
        let peer = registry.session();
        let shutdown = peer_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = simulate_peer(peer, Duration::from_secs(secs), shutdown).await {
                error!("Simulated peer failed: {}", e);
            }
        });
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
        () = Bootable::wait(&controller) => {
            error!(
                "Membership lost: {}",
                controller.fatal_reason().unwrap_or_default()
            );
        }
    }

    peer_shutdown.cancel();
    controller.deregister().await;

    let calls = failover.calls().await;
    info!("{} failover(s) requested during this run", calls.len());

    Ok(())
}

/// Joins as a worker, then drops out without deregistering.
async fn simulate_peer(
    peer: MemoryRegistry,
    lifetime: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let address = NodeAddress::new("127.0.0.2", 1234);
    let node_path = path::node_path(NodeType::Worker, &address);

    peer.persist_ephemeral(&node_path, Bytes::from_static(b"{}"))
        .await?;
    info!("Simulated peer registered at {}", node_path);

    tokio::select! {
        () = tokio::time::sleep(lifetime) => {
            info!("Simulated peer {} drops its session", address);
            peer.lose().await;
        }
        () = shutdown.cancelled() => {
            peer.close().await?;
        }
    }

    Ok(())
}
