//! Mock implementation of the failover service that records every request.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowd_failover::FailoverService;
use flowd_registry::NodeType;
use tokio::sync::Mutex;
use tracing::info;

/// A single recorded failover request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailoverCall {
    /// Host passed to the service.
    pub server_host: String,

    /// Node type passed to the service.
    pub node_type: NodeType,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<FailoverCall>,
    failures_remaining: usize,
    delay: Option<Duration>,
}

/// Failover service that records requests instead of recovering anything.
#[derive(Clone, Debug, Default)]
pub struct MockFailoverService {
    state: Arc<Mutex<MockState>>,
}

impl MockFailoverService {
    /// Creates a new `MockFailoverService`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` requests fail after being recorded.
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.failures_remaining = count;
    }

    /// Makes every request take `delay` before completing.
    pub async fn set_delay(&self, delay: Duration) {
        self.state.lock().await.delay = Some(delay);
    }

    /// All requests received so far, in arrival order.
    pub async fn calls(&self) -> Vec<FailoverCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of requests received for a host.
    pub async fn calls_for(&self, server_host: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.server_host == server_host)
            .count()
    }
}

#[async_trait]
impl FailoverService for MockFailoverService {
    type Error = Error;

    async fn failover_server_when_down(
        &self,
        server_host: &str,
        node_type: NodeType,
    ) -> Result<(), Self::Error> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.push(FailoverCall {
                server_host: server_host.to_string(),
                node_type,
            });

            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(Error::Injected(server_host.to_string()));
            }

            state.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        info!("Mock failover of {} {} complete", node_type, server_host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls() {
        let service = MockFailoverService::new();

        service
            .failover_server_when_down("10.0.0.2", NodeType::Worker)
            .await
            .unwrap();

        assert_eq!(
            service.calls().await,
            vec![FailoverCall {
                server_host: "10.0.0.2".to_string(),
                node_type: NodeType::Worker,
            }]
        );
    }

    #[tokio::test]
    async fn test_injected_failure_is_still_recorded() {
        let service = MockFailoverService::new();
        service.fail_next(1).await;

        assert!(
            service
                .failover_server_when_down("10.0.0.2", NodeType::Worker)
                .await
                .is_err()
        );
        assert!(
            service
                .failover_server_when_down("10.0.0.2", NodeType::Worker)
                .await
                .is_ok()
        );
        assert_eq!(service.calls_for("10.0.0.2").await, 2);
    }
}
