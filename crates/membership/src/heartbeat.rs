//! Liveness records and the periodic task that publishes them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use flowd_registry::{NodeType, RegistryClient};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::SystemMetrics;
use crate::state::RegistrationState;

/// Liveness record stored at a node's registry path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    /// When the process started, in epoch milliseconds.
    pub startup_time_millis: i64,
    /// One-minute load average at report time.
    pub cpu_load_average: f64,
    /// Configured load average threshold.
    pub max_cpu_load_average: f64,
    /// Configured reserved memory, in GB.
    pub reserved_memory: f64,
    /// Available memory at report time, in GB.
    pub available_memory: f64,
    /// When this record was built, in epoch milliseconds.
    pub report_time_millis: i64,
    /// Role of the reporting node.
    pub node_type: NodeType,
    /// Ports the node serves on.
    pub listen_ports: Vec<u16>,
    /// OS process id of the reporting node.
    pub process_id: u32,
}

impl HeartbeatRecord {
    /// Encodes the record as a registry value.
    ///
    /// # Errors
    /// Returns `Error::Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a registry value.
    ///
    /// # Errors
    /// Returns `Error::Serialization` if the value is not a heartbeat record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Static inputs of a heartbeat reporter.
#[derive(Clone, Debug)]
pub struct HeartbeatReporterOptions {
    /// Role of this node.
    pub node_type: NodeType,
    /// Registry path the record is written to.
    pub node_path: String,
    /// Process start, in epoch milliseconds.
    pub startup_time_millis: i64,
    /// Reported load average threshold.
    pub max_cpu_load_avg: f64,
    /// Reported reserved memory, in GB.
    pub reserved_memory: f64,
    /// Reported ports.
    pub listen_ports: Vec<u16>,
    /// Consecutive publish failures before liveness counts as degraded.
    pub degraded_after_failures: u32,
}

/// Builds and publishes this node's heartbeat record.
pub struct HeartbeatReporter<R>
where
    R: RegistryClient,
{
    registry: Arc<R>,
    metrics: Arc<dyn SystemMetrics>,
    options: HeartbeatReporterOptions,
    /// Serializes every write of the node's own record
    publish_lock: Mutex<()>,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
    last_report_millis: AtomicI64,
}

impl<R> HeartbeatReporter<R>
where
    R: RegistryClient,
{
    /// Create a new reporter
    pub fn new(
        registry: Arc<R>,
        metrics: Arc<dyn SystemMetrics>,
        options: HeartbeatReporterOptions,
    ) -> Self {
        Self {
            registry,
            metrics,
            options,
            publish_lock: Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            last_report_millis: AtomicI64::new(0),
        }
    }

    /// Registry path of the record.
    pub fn node_path(&self) -> &str {
        &self.options.node_path
    }

    /// Samples metrics into a fresh record.
    ///
    /// Report times never go backwards, even if the wall clock does.
    pub fn build_record(&self) -> HeartbeatRecord {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self.last_report_millis.fetch_max(now, Ordering::SeqCst);

        HeartbeatRecord {
            startup_time_millis: self.options.startup_time_millis,
            cpu_load_average: self.metrics.load_average(),
            max_cpu_load_average: self.options.max_cpu_load_avg,
            reserved_memory: self.options.reserved_memory,
            available_memory: self.metrics.available_memory_gb(),
            report_time_millis: now.max(previous),
            node_type: self.options.node_type,
            listen_ports: self.options.listen_ports.clone(),
            process_id: std::process::id(),
        }
    }

    /// Overwrites the node's record.
    ///
    /// # Errors
    /// Returns an error if the record cannot be encoded or written.
    pub async fn publish(&self) -> Result<()> {
        let _guard = self.publish_lock.lock().await;
        self.write_record().await
    }

    /// Removes the node's record, then writes a fresh one.
    ///
    /// # Errors
    /// Returns an error if either registry operation fails.
    pub async fn republish(&self) -> Result<()> {
        let _guard = self.publish_lock.lock().await;
        self.replace_record().await
    }

    /// Holds off heartbeat writes until the guard is dropped.
    pub(crate) async fn hold_publishing(&self) -> MutexGuard<'_, ()> {
        self.publish_lock.lock().await
    }

    pub(crate) async fn replace_record(&self) -> Result<()> {
        self.registry
            .remove(&self.options.node_path)
            .await
            .map_err(|e| Error::Registry(e.to_string()))?;

        self.write_record().await
    }

    async fn write_record(&self) -> Result<()> {
        let value = self.build_record().to_bytes()?;

        self.registry
            .persist_ephemeral(&self.options.node_path, value)
            .await
            .map_err(|e| Error::Registry(e.to_string()))
    }

    /// One scheduled heartbeat. Failures are counted, never returned.
    pub async fn tick(&self, state: RegistrationState) {
        if !state.is_live() {
            debug!(
                "Skipping heartbeat for {} in state {}",
                self.options.node_path, state
            );
            return;
        }

        match self.publish().await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("Heartbeat for {} recovered", self.options.node_path);
                }
                debug!("Heartbeat published for {}", self.options.node_path);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Heartbeat for {} failed ({} in a row): {}",
                    self.options.node_path, failures, e
                );

                if failures >= self.options.degraded_after_failures
                    && !self.degraded.swap(true, Ordering::SeqCst)
                {
                    error!(
                        "Liveness degraded for {}: {} consecutive heartbeat failures",
                        self.options.node_path, failures
                    );
                }
            }
        }
    }

    /// Heartbeat failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Whether enough heartbeats failed in a row for peers to drop this node.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

struct ScheduledHeartbeat {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns the recurring heartbeat task.
#[derive(Default)]
pub(crate) struct HeartbeatSchedule {
    scheduled: Mutex<Option<ScheduledHeartbeat>>,
}

impl HeartbeatSchedule {
    /// Starts ticking every `period`, first tick immediately.
    pub(crate) async fn start<R>(
        &self,
        reporter: Arc<HeartbeatReporter<R>>,
        period: Duration,
        state: watch::Receiver<RegistrationState>,
    ) where
        R: RegistryClient,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!("Heartbeat task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let current = *state.borrow();
                        reporter.tick(current).await;
                    }
                }
            }
        });

        let previous = self
            .scheduled
            .lock()
            .await
            .replace(ScheduledHeartbeat { task, cancel });

        if let Some(previous) = previous {
            warn!("Replacing an already scheduled heartbeat");
            previous.cancel.cancel();
        }
    }

    /// Cancels the task and waits for an in-flight tick to finish.
    pub(crate) async fn stop(&self, timeout: Duration) {
        let Some(scheduled) = self.scheduled.lock().await.take() else {
            return;
        };

        scheduled.cancel.cancel();
        let abort = scheduled.task.abort_handle();

        match tokio::time::timeout(timeout, scheduled.task).await {
            Ok(Ok(())) => debug!("Heartbeat task stopped"),
            Ok(Err(e)) => error!("Heartbeat task failed: {}", e),
            Err(_) => {
                error!("Heartbeat task did not stop within {:?}, aborting", timeout);
                abort.abort();
            }
        }
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.scheduled
            .lock()
            .await
            .as_ref()
            .is_some_and(|scheduled| !scheduled.task.is_finished())
    }
}
