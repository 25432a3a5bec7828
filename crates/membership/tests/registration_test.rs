//! Self-registration, heartbeating and deregistration

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use common::{MASTER_HOST, MASTER_PATH, TestNode, eventually, fast_config};
use flowd_bootable::Bootable;
use flowd_membership::{Error, HeartbeatRecord, MembershipConfig, RegistrationState};
use flowd_registry::{EventKind, NodeType, RegistryClient, RegistryEvent, SubscriptionListener};
use tokio::sync::Mutex;
use tracing_test::traced_test;

#[derive(Default)]
struct EventCollector {
    events: Mutex<Vec<RegistryEvent>>,
}

#[async_trait]
impl SubscriptionListener for EventCollector {
    async fn notify(&self, event: RegistryEvent) {
        self.events.lock().await.push(event);
    }
}

#[tokio::test]
#[traced_test]
async fn test_start_registers_own_path() {
    let node = TestNode::started().await;

    assert_eq!(node.controller.state(), RegistrationState::Active);
    assert!(node.controller.heartbeat_running().await);

    let record = node.record(MASTER_PATH).await.expect("own record missing");
    assert_eq!(record.node_type, NodeType::Master);
    assert_eq!(record.listen_ports, vec![5678]);
    assert!(
        node.registry
            .check_node_exists(MASTER_HOST, NodeType::Master)
            .await
            .unwrap()
    );
    assert!(node.registry.keys_under("/dead-servers").await.is_empty());

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_start_clears_marker_of_previous_incarnation() {
    let node = TestNode::new();
    let peer = node.registry.session();
    peer.persist("/dead-servers/master_10.0.0.1:5678", Bytes::from_static(b"{}"))
        .await
        .unwrap();

    node.controller.start().await.unwrap();

    assert!(
        node.registry
            .get("/dead-servers/master_10.0.0.1:5678")
            .await
            .is_none()
    );

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_registering_twice_leaves_one_record() {
    let node = TestNode::started().await;

    node.controller.register().await.unwrap();
    node.controller.register().await.unwrap();

    assert_eq!(
        node.registry.keys_under("/nodes/master").await,
        vec![MASTER_PATH.to_string()]
    );

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let node = TestNode::started().await;

    assert_matches!(
        node.controller.start().await,
        Err(Error::AlreadyStarted(RegistrationState::Active))
    );

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_start_fails_when_node_never_visible() {
    let node = TestNode::new();
    node.registry.hide_nodes(100).await;

    assert_matches!(
        node.controller.start().await,
        Err(Error::RegistrationTimeout { attempts: 5, .. })
    );
    assert_eq!(node.controller.state(), RegistrationState::Deregistered);
    assert!(!node.controller.heartbeat_running().await);
    assert!(node.controller.fatal_token().is_cancelled());
}

#[tokio::test]
async fn test_start_survives_lagging_visibility() {
    let node = TestNode::new();
    node.registry.hide_nodes(2).await;

    node.controller.start().await.unwrap();
    assert_eq!(node.controller.state(), RegistrationState::Active);

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_invalid_config_fails_start() {
    let node = TestNode::with_config(MembershipConfig {
        heartbeat_interval: Duration::ZERO,
        ..fast_config()
    });

    assert_matches!(node.controller.start().await, Err(Error::Configuration(_)));
    assert_eq!(node.controller.state(), RegistrationState::Unregistered);
}

#[tokio::test]
async fn test_heartbeat_ticks_advance_report_time() {
    let node = TestNode::started().await;
    let collector = Arc::new(EventCollector::default());
    node.registry
        .session()
        .subscribe("/nodes", collector.clone())
        .await
        .unwrap();

    // About five heartbeat intervals
    tokio::time::sleep(Duration::from_millis(260)).await;
    node.controller.deregister().await;

    let report_times: Vec<i64> = collector
        .events
        .lock()
        .await
        .iter()
        .filter(|event| event.kind == EventKind::Updated && event.path == MASTER_PATH)
        .filter_map(|event| event.data.as_ref())
        .map(|data| HeartbeatRecord::from_bytes(data).unwrap().report_time_millis)
        .collect();

    assert!(
        report_times.len() >= 3,
        "expected at least 3 heartbeats, saw {}",
        report_times.len()
    );
    assert!(report_times.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(report_times.last() > report_times.first());
}

#[tokio::test]
async fn test_heartbeat_restores_externally_removed_path() {
    let node = TestNode::started().await;

    node.registry.remove(MASTER_PATH).await.unwrap();

    let registry = &node.registry;
    eventually(Duration::from_secs(2), move || async move {
        registry.get(MASTER_PATH).await.is_some()
    })
    .await;

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_deregister_removes_path_and_stops_heartbeat() {
    let node = TestNode::started().await;

    node.controller.deregister().await;

    assert_eq!(node.controller.state(), RegistrationState::Deregistered);
    assert!(!node.controller.heartbeat_running().await);
    assert!(node.registry.get(MASTER_PATH).await.is_none());

    // A few heartbeat periods later the path is still gone
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node.registry.get(MASTER_PATH).await.is_none());
    assert!(!node.controller.fatal_token().is_cancelled());
}

#[tokio::test]
async fn test_deregister_before_start_is_harmless() {
    let node = TestNode::new();

    node.controller.deregister().await;

    assert_eq!(node.controller.state(), RegistrationState::Deregistered);
    assert!(node.controller.local_node().is_none());
}

#[tokio::test]
async fn test_bootable_lifecycle() {
    let node = TestNode::new();
    let controller = node.controller.clone();

    Bootable::start(&controller).await.unwrap();
    assert_eq!(controller.bootable_name(), "ClusterMembershipController");

    let waiter = {
        let controller = controller.clone();
        tokio::spawn(async move { Bootable::wait(&controller).await })
    };

    Bootable::shutdown(&controller).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("wait did not return after shutdown")
        .unwrap();
}
