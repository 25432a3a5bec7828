//! Test helpers for membership controllers backed by the in-memory registry
//!
//! Every controller built here shares one store with the test, so the test can
//! act as a peer through `MemoryRegistry::session`.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flowd_failover_mock::MockFailoverService;
use flowd_membership::{
    ClusterMembershipController, HeartbeatRecord, MembershipConfig, RegistrationRetryConfig,
    StaticMetrics,
};
use flowd_registry::NodeType;
use flowd_registry_memory::MemoryRegistry;

/// Master host used by the controller under test
pub const MASTER_HOST: &str = "10.0.0.1";

/// Path the controller under test registers at
pub const MASTER_PATH: &str = "/nodes/master/10.0.0.1:5678";

/// A peer worker the tests make disappear
pub const WORKER_PATH: &str = "/nodes/worker/10.0.0.2:5679";

/// Dead marker of the peer worker
pub const WORKER_MARKER: &str = "/dead-servers/worker_10.0.0.2:5679";

pub type TestController = ClusterMembershipController<MemoryRegistry, MockFailoverService>;

/// A controller under test and its collaborators
pub struct TestNode {
    pub controller: TestController,
    pub registry: MemoryRegistry,
    pub failover: MockFailoverService,
}

/// Configuration with short timings
pub fn fast_config() -> MembershipConfig {
    MembershipConfig {
        node_type: NodeType::Master,
        listen_port: 5678,
        host: Some(MASTER_HOST.to_string()),
        heartbeat_interval: Duration::from_millis(50),
        registration_retry: RegistrationRetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        },
        dead_marker_settle_delay: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(1),
        ..MembershipConfig::default()
    }
}

impl TestNode {
    /// Build a master with the fast configuration
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Build a node with a custom configuration
    pub fn with_config(config: MembershipConfig) -> Self {
        let registry = MemoryRegistry::new();
        let failover = MockFailoverService::new();
        let controller = ClusterMembershipController::with_metrics(
            config,
            Arc::new(registry.clone()),
            Arc::new(failover.clone()),
            Arc::new(StaticMetrics {
                load_average: 0.25,
                available_memory_gb: 8.0,
            }),
        );

        Self {
            controller,
            registry,
            failover,
        }
    }

    /// Build and start a master with the fast configuration
    pub async fn started() -> Self {
        let node = Self::new();
        node.controller
            .start()
            .await
            .expect("controller failed to start");
        node
    }

    /// Current heartbeat record at `path`
    pub async fn record(&self, path: &str) -> Option<HeartbeatRecord> {
        let bytes = self.registry.get(path).await?;
        Some(HeartbeatRecord::from_bytes(&bytes).expect("invalid heartbeat record"))
    }
}

/// Polls `check` until it holds, panicking after `timeout`
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
