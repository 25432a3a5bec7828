//! Abstract interface to the coordination store that backs cluster membership.
//!
//! This crate provides:
//! - Node identity types (`NodeType`, `NodeAddress`)
//! - The registry path layout shared by masters and workers
//! - The `RegistryClient` trait and its listener traits
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod event;
mod listener;
mod node;
pub mod path;

pub use event::{ConnectionState, EventKind, RegistryEvent};
pub use listener::{ConnectionStateListener, SubscriptionListener};
pub use node::{NodeAddress, NodeAddressError, NodeType};

use std::error::Error;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Marker trait for `RegistryClient` errors
pub trait RegistryClientError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error
    fn kind(&self) -> RegistryClientErrorKind;
}

/// The kind of registry client error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistryClientErrorKind {
    /// The session to the coordination store is not usable right now.
    Connection,

    /// The client has been closed.
    Closed,

    /// Any other failure reported by the store.
    Other,
}

impl fmt::Display for RegistryClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A client session against the coordination store.
///
/// One client is shared by every component of a node. Only the owner of the
/// node's lifecycle may call [`RegistryClient::close`].
#[async_trait]
pub trait RegistryClient: Send + Sync + 'static {
    /// The error type for registry operations.
    type Error: RegistryClientError;

    /// Creates or overwrites an ephemeral key bound to this client's session.
    async fn persist_ephemeral(&self, path: &str, value: Bytes) -> Result<(), Self::Error>;

    /// Creates or overwrites a persistent key.
    async fn persist(&self, path: &str, value: Bytes) -> Result<(), Self::Error>;

    /// Removes a key. Removing an absent key is not an error.
    async fn remove(&self, path: &str) -> Result<(), Self::Error>;

    /// Returns whether a key currently exists.
    async fn exists(&self, path: &str) -> Result<bool, Self::Error>;

    /// Returns whether a node of the given type and host is currently listed
    /// under its type's subtree.
    async fn check_node_exists(&self, host: &str, node_type: NodeType)
    -> Result<bool, Self::Error>;

    /// Watches every key below `root_path`. Events are delivered to the
    /// listener until the client is closed.
    async fn subscribe(
        &self,
        root_path: &str,
        listener: Arc<dyn SubscriptionListener>,
    ) -> Result<(), Self::Error>;

    /// Registers a listener for session state transitions.
    async fn add_connection_state_listener(
        &self,
        listener: Arc<dyn ConnectionStateListener>,
    ) -> Result<(), Self::Error>;

    /// Closes the session. Ephemeral keys owned by it disappear.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Extracts the host from the last segment of an event path, if any.
    fn get_host_by_event_data_path(&self, path: &str) -> Option<String> {
        path::host_of(path)
    }
}
