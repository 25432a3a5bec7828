//! In-memory (single process) implementation of the registry client for local
//! development and tests.
//!
//! Every [`MemoryRegistry`] is one session against a shared store. Sessions
//! created with [`MemoryRegistry::session`] see the same keys and events, but
//! own their ephemeral keys separately, so several nodes can be simulated in
//! one process.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use flowd_registry::path::{host_of, is_child_of};
use flowd_registry::{
    ConnectionState, ConnectionStateListener, NodeType, RegistryClient, RegistryEvent,
    SubscriptionListener,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

#[derive(Clone, Debug)]
struct Entry {
    value: Bytes,
    owner: Option<u64>,
}

struct Subscriber {
    session: u64,
    root: String,
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

#[derive(Default)]
struct Store {
    entries: Mutex<BTreeMap<String, Entry>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_session: AtomicU64,
}

impl Store {
    async fn publish(&self, event: RegistryEvent) {
        let subscribers = self.subscribers.lock().await;
        for subscriber in subscribers.iter() {
            if is_child_of(&event.path, &subscriber.root) {
                // A closed receiver means the delivery task is gone.
                let _ = subscriber.tx.send(event.clone());
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SessionState {
    Connected,
    Suspended,
    Lost,
    Closed,
}

#[derive(Default)]
struct Faults {
    failing_writes: usize,
    hidden_node_checks: usize,
}

struct Session {
    id: u64,
    state: Mutex<SessionState>,
    listeners: Mutex<Vec<Arc<dyn ConnectionStateListener>>>,
    faults: Mutex<Faults>,
}

impl Session {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState::Connected),
            listeners: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        }
    }
}

/// In-memory registry client.
#[derive(Clone)]
pub struct MemoryRegistry {
    store: Arc<Store>,
    session: Arc<Session>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("session", &self.session.id)
            .finish_non_exhaustive()
    }
}

impl MemoryRegistry {
    /// Creates a new store with one connected session.
    #[must_use]
    pub fn new() -> Self {
        let store = Arc::new(Store::default());
        let id = store.next_session.fetch_add(1, Ordering::SeqCst);

        Self {
            store,
            session: Arc::new(Session::new(id)),
        }
    }

    /// Opens another session against the same store.
    #[must_use]
    pub fn session(&self) -> Self {
        let id = self.store.next_session.fetch_add(1, Ordering::SeqCst);

        Self {
            store: Arc::clone(&self.store),
            session: Arc::new(Session::new(id)),
        }
    }

    async fn ensure_connected(&self) -> Result<(), Error> {
        match *self.session.state.lock().await {
            SessionState::Connected => Ok(()),
            SessionState::Suspended => Err(Error::Connection("suspended")),
            SessionState::Lost => Err(Error::Connection("lost")),
            SessionState::Closed => Err(Error::Closed),
        }
    }

    async fn take_write_fault(&self, path: &str) -> Result<(), Error> {
        let mut faults = self.session.faults.lock().await;
        if faults.failing_writes > 0 {
            faults.failing_writes -= 1;
            return Err(Error::Injected(path.to_string()));
        }
        Ok(())
    }

    async fn put(&self, path: &str, value: Bytes, owner: Option<u64>) -> Result<(), Error> {
        self.ensure_connected().await?;
        self.take_write_fault(path).await?;

        let mut entries = self.store.entries.lock().await;
        let previous = entries.insert(
            path.to_string(),
            Entry {
                value: value.clone(),
                owner,
            },
        );

        let event = if previous.is_some() {
            RegistryEvent::updated(path, value)
        } else {
            RegistryEvent::added(path, value)
        };
        self.store.publish(event).await;

        Ok(())
    }

    async fn drop_ephemeral_keys(&self) {
        let mut entries = self.store.entries.lock().await;
        let owned: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.owner == Some(self.session.id))
            .map(|(path, _)| path.clone())
            .collect();

        for path in owned {
            entries.remove(&path);
            debug!("Ephemeral key {} expired with session {}", path, self.session.id);
            self.store.publish(RegistryEvent::removed(path)).await;
        }
    }

    async fn transition(&self, state: SessionState, reported: ConnectionState) {
        *self.session.state.lock().await = state;
        info!("Registry session {} is {}", self.session.id, reported);

        let listeners = self.session.listeners.lock().await.clone();
        for listener in listeners {
            listener.on_state_change(reported).await;
        }
    }

    /// Marks the session suspended and notifies listeners.
    pub async fn suspend(&self) {
        self.transition(SessionState::Suspended, ConnectionState::Suspended)
            .await;
    }

    /// Resumes the session and notifies listeners.
    ///
    /// With `expire_ephemeral`, the session's ephemeral keys are dropped first,
    /// as a store does when the outage outlived the session timeout.
    pub async fn reconnect(&self, expire_ephemeral: bool) {
        if expire_ephemeral {
            self.drop_ephemeral_keys().await;
        }
        self.transition(SessionState::Connected, ConnectionState::Reconnected)
            .await;
    }

    /// Loses the session for good and notifies listeners.
    pub async fn lose(&self) {
        self.drop_ephemeral_keys().await;
        self.transition(SessionState::Lost, ConnectionState::Lost)
            .await;
    }

    /// Makes the next `count` writes from this session fail.
    pub async fn fail_writes(&self, count: usize) {
        self.session.faults.lock().await.failing_writes = count;
    }

    /// Makes the next `count` node listings miss every node, as a lagging
    /// read replica would.
    pub async fn hide_nodes(&self, count: usize) {
        self.session.faults.lock().await.hidden_node_checks = count;
    }

    /// Delivers an event to subscribers without touching the stored keys.
    pub async fn inject_event(&self, event: RegistryEvent) {
        self.store.publish(event).await;
    }

    /// Current value of a key.
    pub async fn get(&self, path: &str) -> Option<Bytes> {
        self.store
            .entries
            .lock()
            .await
            .get(path)
            .map(|entry| entry.value.clone())
    }

    /// Keys strictly below `root`, in order.
    pub async fn keys_under(&self, root: &str) -> Vec<String> {
        self.store
            .entries
            .lock()
            .await
            .keys()
            .filter(|path| is_child_of(path, root))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    type Error = Error;

    async fn persist_ephemeral(&self, path: &str, value: Bytes) -> Result<(), Self::Error> {
        self.put(path, value, Some(self.session.id)).await
    }

    async fn persist(&self, path: &str, value: Bytes) -> Result<(), Self::Error> {
        self.put(path, value, None).await
    }

    async fn remove(&self, path: &str) -> Result<(), Self::Error> {
        self.ensure_connected().await?;
        self.take_write_fault(path).await?;

        let mut entries = self.store.entries.lock().await;
        if entries.remove(path).is_some() {
            self.store.publish(RegistryEvent::removed(path)).await;
        }

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, Self::Error> {
        self.ensure_connected().await?;

        Ok(self.store.entries.lock().await.contains_key(path))
    }

    async fn check_node_exists(
        &self,
        host: &str,
        node_type: NodeType,
    ) -> Result<bool, Self::Error> {
        self.ensure_connected().await?;

        {
            let mut faults = self.session.faults.lock().await;
            if faults.hidden_node_checks > 0 {
                faults.hidden_node_checks -= 1;
                return Ok(false);
            }
        }

        let entries = self.store.entries.lock().await;
        Ok(entries.keys().any(|path| {
            is_child_of(path, node_type.registry_root())
                && host_of(path).is_some_and(|node_host| node_host == host)
        }))
    }

    async fn subscribe(
        &self,
        root_path: &str,
        listener: Arc<dyn SubscriptionListener>,
    ) -> Result<(), Self::Error> {
        self.ensure_connected().await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<RegistryEvent>();
        self.store.subscribers.lock().await.push(Subscriber {
            session: self.session.id,
            root: root_path.to_string(),
            tx,
        });

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                listener.notify(event).await;
            }
        });

        debug!(
            "Session {} subscribed to {}",
            self.session.id, root_path
        );

        Ok(())
    }

    async fn add_connection_state_listener(
        &self,
        listener: Arc<dyn ConnectionStateListener>,
    ) -> Result<(), Self::Error> {
        self.session.listeners.lock().await.push(listener);
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        {
            let mut state = self.session.state.lock().await;
            if *state == SessionState::Closed {
                return Ok(());
            }
            *state = SessionState::Closed;
        }

        self.drop_ephemeral_keys().await;
        self.store
            .subscribers
            .lock()
            .await
            .retain(|subscriber| subscriber.session != self.session.id);
        self.session.listeners.lock().await.clear();

        info!("Registry session {} closed", self.session.id);
        Ok(())
    }
}
