//! Registration lifecycle of the local node.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use flowd_bootable::{Bootable, BootableError};
use flowd_failover::FailoverService;
use flowd_registry::{NodeAddress, NodeType, RegistryClient, path};
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::MembershipConfig;
use crate::connection::ConnectionStateHandler;
use crate::dead_nodes::DeadNodeMarkers;
use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatReporter, HeartbeatReporterOptions, HeartbeatSchedule};
use crate::listener::NodeEventListener;
use crate::metrics::{HostMetrics, SystemMetrics};
use crate::resolver::{DeadNodeResolver, ResolveOutcome};
use crate::state::{FatalSignal, RegistrationState, StateCell};

/// Identity of this process in the cluster, fixed by `init`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalNode {
    /// Role of this node.
    pub node_type: NodeType,
    /// `host:port` of this node.
    pub address: NodeAddress,
    /// Registry path this node registers at.
    pub path: String,
    /// Process start, in epoch milliseconds.
    pub startup_time_millis: i64,
}

struct Initialized<R>
where
    R: RegistryClient,
{
    node: LocalNode,
    reporter: Arc<HeartbeatReporter<R>>,
}

/// Owns this node's presence in the registry and reacts to other nodes
/// leaving it.
pub struct ClusterMembershipController<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    config: Arc<MembershipConfig>,
    registry: Arc<R>,
    metrics: Arc<dyn SystemMetrics>,
    initialized: Arc<OnceCell<Initialized<R>>>,
    state: Arc<StateCell>,
    heartbeat: Arc<HeartbeatSchedule>,
    resolver: Arc<DeadNodeResolver<R, F>>,
    event_tasks: TaskTracker,
    fatal: FatalSignal,
    stopped: CancellationToken,
}

impl<R, F> ClusterMembershipController<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    /// Create a controller sampling metrics from the host
    pub fn new(config: MembershipConfig, registry: Arc<R>, failover: Arc<F>) -> Self {
        Self::with_metrics(config, registry, failover, Arc::new(HostMetrics::new()))
    }

    /// Create a controller with a custom metrics source
    pub fn with_metrics(
        config: MembershipConfig,
        registry: Arc<R>,
        failover: Arc<F>,
        metrics: Arc<dyn SystemMetrics>,
    ) -> Self {
        let markers = Arc::new(DeadNodeMarkers::with_retention(
            registry.clone(),
            config.dead_marker_retention,
        ));
        let resolver = Arc::new(DeadNodeResolver::new(registry.clone(), failover, markers));

        Self {
            config: Arc::new(config),
            registry,
            metrics,
            initialized: Arc::new(OnceCell::new()),
            state: Arc::new(StateCell::new()),
            heartbeat: Arc::new(HeartbeatSchedule::default()),
            resolver,
            event_tasks: TaskTracker::new(),
            fatal: FatalSignal::default(),
            stopped: CancellationToken::new(),
        }
    }

    /// Resolves this node's address and startup time. Later calls return the
    /// same identity.
    ///
    /// # Errors
    /// Returns `Error::Configuration` if the configuration is invalid.
    pub fn init(&self) -> Result<&LocalNode> {
        Ok(&self.initialized()?.node)
    }

    fn initialized(&self) -> Result<&Initialized<R>> {
        self.initialized.get_or_try_init(|| {
            self.config.validate()?;

            let address = self.config.node_address();
            let node = LocalNode {
                node_type: self.config.node_type,
                path: self.config.node_path(&address),
                address,
                startup_time_millis: chrono::Utc::now().timestamp_millis(),
            };

            let reporter = Arc::new(HeartbeatReporter::new(
                self.registry.clone(),
                self.metrics.clone(),
                HeartbeatReporterOptions {
                    node_type: node.node_type,
                    node_path: node.path.clone(),
                    startup_time_millis: node.startup_time_millis,
                    max_cpu_load_avg: self.config.max_cpu_load_avg,
                    reserved_memory: self.config.reserved_memory,
                    listen_ports: self.config.listen_ports(),
                    degraded_after_failures: self.config.degraded_after_failures,
                },
            ));

            info!("{} node initialized at {}", node.node_type, node.path);
            Ok(Initialized { node, reporter })
        })
    }

    /// Registers this node, starts heartbeating, and starts watching the node
    /// tree.
    ///
    /// # Errors
    /// Any error is fatal for this process: the node could not join the
    /// cluster and must not serve traffic.
    pub async fn start(&self) -> Result<()> {
        let Initialized { node, reporter } = self.initialized()?;

        self.state
            .transition(RegistrationState::Registering)
            .map_err(|_| Error::AlreadyStarted(self.state.get()))?;

        info!("{} node {} registering to registry...", node.node_type, node.address);

        // Installed first so that a session lost during registration aborts it
        let handler = Arc::new(ConnectionStateHandler::new(
            reporter.clone(),
            self.state.clone(),
            self.heartbeat.clone(),
            self.fatal.clone(),
            self.config.shutdown_timeout,
        ));

        let started = async {
            self.registry
                .add_connection_state_listener(handler)
                .await
                .map_err(|e| Error::Registry(e.to_string()))?;

            self.register().await?;

            self.state.transition(RegistrationState::Active).map_err(|e| {
                if self.fatal.is_triggered() {
                    Error::SessionLost
                } else {
                    e
                }
            })?;

            self.heartbeat
                .start(
                    reporter.clone(),
                    self.config.heartbeat_interval,
                    self.state.subscribe(),
                )
                .await;

            let listener = Arc::new(NodeEventListener::new(self.clone(), self.event_tasks.clone()));
            self.registry
                .subscribe(path::NODES_ROOT, listener)
                .await
                .map_err(|e| Error::Registry(e.to_string()))?;

            // A loss after the ACTIVE transition found no heartbeat to stop
            if self.fatal.is_triggered() {
                return Err(Error::SessionLost);
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = started {
            error!("{} node {} start up failed: {}", node.node_type, node.address, e);
            self.heartbeat.stop(self.config.shutdown_timeout).await;
            if let Err(e) = self.state.transition(RegistrationState::Deregistered) {
                debug!("Start up failed: {}", e);
            }
            self.fatal.trigger(format!("start up failed: {e}"));
            return Err(e);
        }

        info!(
            "{} node {} registered successfully with heartbeat interval {:?}",
            node.node_type, node.address, self.config.heartbeat_interval
        );
        Ok(())
    }

    /// Self-registration: replace any stale record, wait until the registry
    /// lists this node, then clear a dead marker left by a previous crash.
    ///
    /// Heartbeats are held off for the whole sequence. Running it again leaves
    /// a single record.
    ///
    /// # Errors
    /// Returns `Error::RegistrationTimeout` if the node never becomes visible,
    /// `Error::SessionLost` if the session is lost meanwhile, or a registry
    /// error from the marker cleanup.
    pub async fn register(&self) -> Result<()> {
        let Initialized { node, reporter } = self.initialized()?;
        let _publishing = reporter.hold_publishing().await;

        let retry = &self.config.registration_retry;
        let host = node.address.host();
        let mut delay = retry.initial_delay;
        let mut published = false;
        let mut visible = false;

        for attempt in 1..=retry.max_attempts {
            if self.fatal.is_triggered() {
                return Err(Error::SessionLost);
            }

            // The record may have expired with a session reconnect meanwhile
            if published {
                match self.registry.exists(&node.path).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            "Own record {} vanished during registration, publishing again",
                            node.path
                        );
                        published = false;
                    }
                    Err(e) => warn!(
                        "Checking own record {} failed (attempt {}/{}): {}",
                        node.path, attempt, retry.max_attempts, e
                    ),
                }
            }

            if !published {
                match reporter.replace_record().await {
                    Ok(()) => published = true,
                    Err(e) => warn!(
                        "Publishing {} failed (attempt {}/{}): {}",
                        node.path, attempt, retry.max_attempts, e
                    ),
                }
            }

            if published {
                match self.registry.check_node_exists(host, node.node_type).await {
                    Ok(true) => {
                        visible = true;
                        break;
                    }
                    Ok(false) => warn!(
                        "The current {} node {} cannot be found in registry (attempt {}/{})",
                        node.node_type, host, attempt, retry.max_attempts
                    ),
                    Err(e) => warn!(
                        "Checking registration of {} failed (attempt {}/{}): {}",
                        node.path, attempt, retry.max_attempts, e
                    ),
                }
            }

            if attempt < retry.max_attempts {
                self.pause(delay).await?;
                delay = std::cmp::min(delay.saturating_mul(2), retry.max_delay);
            }
        }

        if !visible {
            return Err(Error::RegistrationTimeout {
                address: node.address.to_string(),
                attempts: retry.max_attempts,
            });
        }

        // Peers may still be failing over our previous incarnation
        self.pause(self.config.dead_marker_settle_delay).await?;

        self.resolver
            .markers()
            .clear(&node.path, node.node_type)
            .await?;

        debug!("Self-registration of {} confirmed", node.path);
        Ok(())
    }

    async fn pause(&self, duration: std::time::Duration) -> Result<()> {
        let fatal = self.fatal.token();
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = fatal.cancelled() => Err(Error::SessionLost),
        }
    }

    /// Leaves the cluster: stops heartbeating, removes this node's record and
    /// closes the registry. Every step runs even if an earlier one fails;
    /// failures are logged only.
    pub async fn deregister(&self) {
        let timeout = self.config.shutdown_timeout;

        if let Err(e) = self.state.transition(RegistrationState::Deregistered) {
            debug!("Deregistering: {}", e);
        }

        self.heartbeat.stop(timeout).await;
        info!("Heartbeat stopped");

        if let Some(Initialized { node, .. }) = self.initialized.get() {
            match self.registry.remove(&node.path).await {
                Ok(()) => info!("{} node {} unregistered from registry", node.node_type, node.address),
                Err(e) => error!("Failed to remove registry path {}: {}", node.path, e),
            }
        }

        if let Err(e) = self.registry.close().await {
            error!("Failed to close registry: {}", e);
        }

        self.event_tasks.close();
        if tokio::time::timeout(timeout, self.event_tasks.wait())
            .await
            .is_err()
        {
            warn!("Node event handlers still running after {:?}", timeout);
        }

        self.stopped.cancel();
    }

    /// Removal handler for master paths.
    pub async fn remove_master_node_path(
        &self,
        node_path: &str,
        node_type: NodeType,
        failover: bool,
    ) -> ResolveOutcome {
        self.resolve_removal(node_path, node_type, failover).await
    }

    /// Removal handler for worker paths.
    pub async fn remove_worker_node_path(
        &self,
        node_path: &str,
        node_type: NodeType,
        failover: bool,
    ) -> ResolveOutcome {
        self.resolve_removal(node_path, node_type, failover).await
    }

    async fn resolve_removal(
        &self,
        node_path: &str,
        node_type: NodeType,
        failover: bool,
    ) -> ResolveOutcome {
        let own_address = self.initialized.get().map(|init| &init.node.address);
        self.resolver
            .resolve(node_path, node_type, failover, own_address)
            .await
    }

    /// A node (re)appeared; forget its dead marker so a later departure is
    /// handled again.
    pub fn node_added(&self, node_path: &str, node_type: NodeType) {
        if self.resolver.markers().release(node_path) {
            info!("{} node {} registered again", node_type, node_path);
        } else {
            debug!("{} node added: {}", node_type, node_path);
        }
    }

    /// This node's identity, once initialized.
    pub fn local_node(&self) -> Option<&LocalNode> {
        self.initialized.get().map(|init| &init.node)
    }

    /// This node's `host:port`, once initialized.
    pub fn address(&self) -> Option<&NodeAddress> {
        self.local_node().map(|node| &node.address)
    }

    /// Registry path of this node, once initialized.
    pub fn node_path(&self) -> Option<&str> {
        self.local_node().map(|node| node.path.as_str())
    }

    /// Current registration state.
    pub fn state(&self) -> RegistrationState {
        self.state.get()
    }

    /// Watches registration state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    /// Cancelled when this node can no longer take part in the cluster.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.token()
    }

    /// Why the fatal token was cancelled.
    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal.reason()
    }

    /// Whether the heartbeat task is scheduled.
    pub async fn heartbeat_running(&self) -> bool {
        self.heartbeat.is_running().await
    }

    /// The heartbeat reporter, once initialized.
    pub fn heartbeat_reporter(&self) -> Option<&Arc<HeartbeatReporter<R>>> {
        self.initialized.get().map(|init| &init.reporter)
    }

    /// Dead-node markers known to this process.
    pub fn dead_node_markers(&self) -> &Arc<DeadNodeMarkers<R>> {
        self.resolver.markers()
    }
}

impl<R, F> Debug for ClusterMembershipController<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMembershipController")
            .field("node", &self.local_node())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl<R, F> Clone for ClusterMembershipController<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            initialized: Arc::clone(&self.initialized),
            state: Arc::clone(&self.state),
            heartbeat: Arc::clone(&self.heartbeat),
            resolver: Arc::clone(&self.resolver),
            event_tasks: self.event_tasks.clone(),
            fatal: self.fatal.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

#[async_trait]
impl<R, F> Bootable for ClusterMembershipController<R, F>
where
    R: RegistryClient,
    F: FailoverService,
{
    fn bootable_name(&self) -> &str {
        "ClusterMembershipController"
    }

    async fn start(&self) -> Result<(), BootableError> {
        Self::start(self).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BootableError> {
        self.deregister().await;
        Ok(())
    }

    async fn wait(&self) {
        let fatal = self.fatal.token();
        tokio::select! {
            () = fatal.cancelled() => {
                error!(
                    "Membership ended: {}",
                    self.fatal.reason().unwrap_or_default()
                );
            }
            () = self.stopped.cancelled() => debug!("Membership deregistered"),
        }
    }
}
