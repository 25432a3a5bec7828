//! Dead-node markers: one entry per departed node path, used to trigger
//! failover at most once per departure.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowd_registry::{NodeType, RegistryClient, path};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DEFAULT_DEAD_MARKER_RETENTION;
use crate::error::{Error, Result};

/// Bookkeeping for a node whose disappearance was confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadNodeMarker {
    /// Role of the departed node.
    pub node_type: NodeType,
    /// When the departure was confirmed, in epoch milliseconds.
    pub detected_at_millis: i64,
    /// Whether failover for this departure completed.
    pub failed_over: bool,
}

/// Local marker map, mirrored to the registry's dead-server subtree.
pub struct DeadNodeMarkers<R>
where
    R: RegistryClient,
{
    registry: Arc<R>,
    markers: DashMap<String, DeadNodeMarker>,
    retention: Duration,
}

impl<R> DeadNodeMarkers<R>
where
    R: RegistryClient,
{
    /// Create an empty marker map with the default retention
    pub fn new(registry: Arc<R>) -> Self {
        Self::with_retention(registry, DEFAULT_DEAD_MARKER_RETENTION)
    }

    /// Create an empty marker map. Markers of completed failovers are kept
    /// for `retention`, then evicted on the next `mark`.
    pub fn with_retention(registry: Arc<R>, retention: Duration) -> Self {
        Self {
            registry,
            markers: DashMap::new(),
            retention,
        }
    }

    /// Records a marker for `node_path`.
    ///
    /// Returns `Ok(false)` without touching the registry if a marker already
    /// exists. If the registry write fails, the local marker is withdrawn so
    /// a later event can try again.
    ///
    /// # Errors
    /// Returns an error if the path has no address or the registry write fails.
    pub async fn mark(&self, node_path: &str, node_type: NodeType) -> Result<bool> {
        let marker_path = marker_path(node_type, node_path)?;
        let marker = DeadNodeMarker {
            node_type,
            detected_at_millis: chrono::Utc::now().timestamp_millis(),
            failed_over: false,
        };
        let value = Bytes::from(serde_json::to_vec(&marker)?);

        self.evict_completed(marker.detected_at_millis);

        match self.markers.entry(node_path.to_string()) {
            Entry::Occupied(_) => {
                debug!("Dead marker for {} already recorded", node_path);
                return Ok(false);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(marker);
            }
        }

        if let Err(e) = self.registry.persist(&marker_path, value).await {
            self.markers.remove(node_path);
            return Err(Error::Registry(e.to_string()));
        }

        info!("Recorded dead marker {} for {}", marker_path, node_path);
        Ok(true)
    }

    /// Notes that failover for `node_path` completed.
    pub fn complete(&self, node_path: &str) {
        if let Some(mut marker) = self.markers.get_mut(node_path) {
            marker.failed_over = true;
        }
    }

    /// Drops the local marker only. Returns whether one existed.
    pub fn release(&self, node_path: &str) -> bool {
        self.markers.remove(node_path).is_some()
    }

    /// Drops the local marker and deletes the registry marker.
    ///
    /// # Errors
    /// Returns an error if the path has no address or the registry delete fails.
    pub async fn clear(&self, node_path: &str, node_type: NodeType) -> Result<()> {
        let marker_path = marker_path(node_type, node_path)?;
        self.markers.remove(node_path);

        self.registry
            .remove(&marker_path)
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;

        debug!("Cleared dead marker {}", marker_path);
        Ok(())
    }

    fn evict_completed(&self, now_millis: i64) {
        let retention = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let before = self.markers.len();

        self.markers.retain(|_, marker| {
            !marker.failed_over
                || now_millis.saturating_sub(marker.detected_at_millis) < retention
        });

        let evicted = before.saturating_sub(self.markers.len());
        if evicted > 0 {
            debug!("Evicted {} completed dead markers", evicted);
        }
    }

    /// Number of local markers.
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// Whether no local marker exists.
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Local marker for `node_path`, if any.
    pub fn get(&self, node_path: &str) -> Option<DeadNodeMarker> {
        self.markers.get(node_path).map(|marker| marker.clone())
    }

    /// Whether a local marker exists for `node_path`.
    pub fn contains(&self, node_path: &str) -> bool {
        self.markers.contains_key(node_path)
    }
}

fn marker_path(node_type: NodeType, node_path: &str) -> Result<String> {
    path::dead_marker_path(node_type, node_path)
        .ok_or_else(|| Error::Registry(format!("no node address in path '{node_path}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowd_registry_memory::MemoryRegistry;

    const PATH: &str = "/nodes/worker/10.0.0.2:5679";
    const MARKER: &str = "/dead-servers/worker_10.0.0.2:5679";

    #[tokio::test]
    async fn test_mark_is_check_and_set() {
        let registry = MemoryRegistry::new();
        let markers = DeadNodeMarkers::new(Arc::new(registry.clone()));

        assert!(markers.mark(PATH, NodeType::Worker).await.unwrap());
        assert!(!markers.mark(PATH, NodeType::Worker).await.unwrap());
        assert!(registry.exists(MARKER).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_marks_create_one_marker() {
        let registry = MemoryRegistry::new();
        let markers = Arc::new(DeadNodeMarkers::new(Arc::new(registry)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let markers = markers.clone();
                tokio::spawn(async move { markers.mark(PATH, NodeType::Worker).await.unwrap() })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_failed_persist_withdraws_marker() {
        let registry = MemoryRegistry::new();
        let markers = DeadNodeMarkers::new(Arc::new(registry.clone()));
        registry.fail_writes(1).await;

        assert!(markers.mark(PATH, NodeType::Worker).await.is_err());
        assert!(!markers.contains(PATH));
        assert!(markers.mark(PATH, NodeType::Worker).await.unwrap());
    }

    #[tokio::test]
    async fn test_completed_markers_are_evicted_after_retention() {
        let registry = MemoryRegistry::new();
        let markers = DeadNodeMarkers::with_retention(Arc::new(registry), Duration::ZERO);

        for i in 0..20 {
            let path = format!("/nodes/worker/10.0.1.{i}:5679");
            assert!(markers.mark(&path, NodeType::Worker).await.unwrap());
            markers.complete(&path);
        }
        assert_eq!(markers.len(), 1);

        // Pending failovers are never evicted
        markers.mark(PATH, NodeType::Worker).await.unwrap();
        markers.mark("/nodes/worker/10.0.0.3:5679", NodeType::Worker).await.unwrap();
        assert!(markers.contains(PATH));
        assert_eq!(markers.len(), 2);
    }

    #[tokio::test]
    async fn test_completed_markers_are_kept_within_retention() {
        let registry = MemoryRegistry::new();
        let markers = DeadNodeMarkers::new(Arc::new(registry));

        markers.mark(PATH, NodeType::Worker).await.unwrap();
        markers.complete(PATH);
        markers.mark("/nodes/worker/10.0.0.3:5679", NodeType::Worker).await.unwrap();

        assert!(!markers.mark(PATH, NodeType::Worker).await.unwrap());
        assert_eq!(markers.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_removes_both_markers() {
        let registry = MemoryRegistry::new();
        let markers = DeadNodeMarkers::new(Arc::new(registry.clone()));

        markers.mark(PATH, NodeType::Worker).await.unwrap();
        markers.complete(PATH);
        assert!(markers.get(PATH).unwrap().failed_over);

        markers.clear(PATH, NodeType::Worker).await.unwrap();
        assert!(!markers.contains(PATH));
        assert!(!registry.exists(MARKER).await.unwrap());
    }
}
