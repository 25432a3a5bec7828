use std::fmt;

use bytes::Bytes;

/// What happened to a watched key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// Key created.
    Added,

    /// Key value replaced.
    Updated,

    /// Key deleted or expired.
    Removed,
}

/// A change notification for a key below a subscribed root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistryEvent {
    /// The kind of change.
    pub kind: EventKind,

    /// Full path of the changed key.
    pub path: String,

    /// Value after the change, absent for removals.
    pub data: Option<Bytes>,
}

impl RegistryEvent {
    /// Creates an `Added` event.
    pub fn added(path: impl Into<String>, data: Bytes) -> Self {
        Self {
            kind: EventKind::Added,
            path: path.into(),
            data: Some(data),
        }
    }

    /// Creates an `Updated` event.
    pub fn updated(path: impl Into<String>, data: Bytes) -> Self {
        Self {
            kind: EventKind::Updated,
            path: path.into(),
            data: Some(data),
        }
    }

    /// Creates a `Removed` event.
    pub fn removed(path: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Removed,
            path: path.into(),
            data: None,
        }
    }
}

/// Session state reported by the coordination store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// First successful connection.
    Connected,

    /// The session may or may not survive.
    Suspended,

    /// The session resumed; ephemeral keys may have expired meanwhile.
    Reconnected,

    /// The session is gone for good.
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "CONNECTED",
            Self::Suspended => "SUSPENDED",
            Self::Reconnected => "RECONNECTED",
            Self::Lost => "LOST",
        };
        f.write_str(name)
    }
}
