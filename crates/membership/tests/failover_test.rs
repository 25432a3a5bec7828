//! Handling of other nodes leaving the cluster

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{MASTER_PATH, TestNode, WORKER_MARKER, WORKER_PATH, eventually};
use flowd_membership::ResolveOutcome;
use flowd_registry::{NodeType, RegistryClient, RegistryEvent};

#[tokio::test]
async fn test_removed_worker_fails_over_once() {
    let node = TestNode::started().await;
    let peer = node.registry.session();
    peer.persist_ephemeral(WORKER_PATH, Bytes::new()).await.unwrap();

    peer.remove(WORKER_PATH).await.unwrap();
    node.registry
        .inject_event(RegistryEvent::removed(WORKER_PATH))
        .await;

    let failover = &node.failover;
    eventually(Duration::from_secs(2), move || async move {
        failover.calls_for("10.0.0.2").await == 1
    })
    .await;

    // Give a duplicate handler time to run
    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls = node.failover.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].server_host, "10.0.0.2");
    assert_eq!(calls[0].node_type, NodeType::Worker);

    assert!(node.registry.get(WORKER_MARKER).await.is_some());
    let marker = node
        .controller
        .dead_node_markers()
        .get(WORKER_PATH)
        .expect("local marker missing");
    assert!(marker.failed_over);

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_transient_removal_does_not_fail_over() {
    let node = TestNode::started().await;
    let peer = node.registry.session();
    peer.persist_ephemeral(WORKER_PATH, Bytes::new()).await.unwrap();

    // The path is still present when the notification arrives
    node.registry
        .inject_event(RegistryEvent::removed(WORKER_PATH))
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(node.failover.calls().await.is_empty());
    assert!(!node.controller.dead_node_markers().contains(WORKER_PATH));

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_own_removal_is_never_failed_over() {
    let node = TestNode::started().await;

    assert_eq!(
        node.controller
            .remove_master_node_path(MASTER_PATH, NodeType::Master, true)
            .await,
        ResolveOutcome::OwnNode
    );

    node.registry
        .inject_event(RegistryEvent::removed(MASTER_PATH))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(node.failover.calls().await.is_empty());
    assert!(node.registry.keys_under("/dead-servers").await.is_empty());

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_malformed_removals_are_dropped() {
    let node = TestNode::started().await;

    assert_eq!(
        node.controller
            .remove_worker_node_path("", NodeType::Worker, true)
            .await,
        ResolveOutcome::Malformed
    );
    assert_eq!(
        node.controller
            .remove_worker_node_path("/nodes/worker/no-port", NodeType::Worker, true)
            .await,
        ResolveOutcome::Malformed
    );
    assert!(node.failover.calls().await.is_empty());

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_rejoined_node_is_failed_over_again() {
    let node = TestNode::started().await;
    let peer = node.registry.session();
    let failover = &node.failover;
    let markers = node.controller.dead_node_markers();

    peer.persist_ephemeral(WORKER_PATH, Bytes::new()).await.unwrap();
    peer.remove(WORKER_PATH).await.unwrap();
    eventually(Duration::from_secs(2), move || async move {
        failover.calls_for("10.0.0.2").await == 1
    })
    .await;

    // Re-registration forgets the previous departure
    peer.persist_ephemeral(WORKER_PATH, Bytes::new()).await.unwrap();
    eventually(Duration::from_secs(2), move || async move {
        !markers.contains(WORKER_PATH)
    })
    .await;

    peer.remove(WORKER_PATH).await.unwrap();
    eventually(Duration::from_secs(2), move || async move {
        failover.calls_for("10.0.0.2").await == 2
    })
    .await;

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_failed_failover_is_retried_on_redelivery() {
    let node = TestNode::started().await;
    node.failover.fail_next(1).await;

    assert_eq!(
        node.controller
            .remove_worker_node_path(WORKER_PATH, NodeType::Worker, true)
            .await,
        ResolveOutcome::FailoverFailed
    );
    assert!(!node.controller.dead_node_markers().contains(WORKER_PATH));

    assert_eq!(
        node.controller
            .remove_worker_node_path(WORKER_PATH, NodeType::Worker, true)
            .await,
        ResolveOutcome::FailedOver
    );
    assert_eq!(node.failover.calls_for("10.0.0.2").await, 2);

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_grouped_worker_removal_fails_over() {
    let node = TestNode::started().await;
    let peer = node.registry.session();
    let path = "/nodes/worker/gpu/10.0.0.3:1234";

    peer.persist_ephemeral(path, Bytes::new()).await.unwrap();
    peer.lose().await;

    let failover = &node.failover;
    eventually(Duration::from_secs(2), move || async move {
        failover.calls_for("10.0.0.3").await == 1
    })
    .await;
    assert!(
        node.registry
            .get("/dead-servers/worker_10.0.0.3:1234")
            .await
            .is_some()
    );

    node.controller.deregister().await;
}

#[tokio::test]
async fn test_removed_master_fails_over() {
    let node = TestNode::started().await;
    let peer = node.registry.session();
    let path = "/nodes/master/10.0.0.9:5678";

    peer.persist_ephemeral(path, Bytes::new()).await.unwrap();
    peer.close().await.unwrap();

    let failover = &node.failover;
    eventually(Duration::from_secs(2), move || async move {
        failover.calls_for("10.0.0.9").await == 1
    })
    .await;
    assert_eq!(node.failover.calls().await[0].node_type, NodeType::Master);

    node.controller.deregister().await;
}
