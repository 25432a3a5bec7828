//! Node identity types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path;

/// The role a process plays in the cluster.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    /// Coordinator process.
    Master,

    /// Executor process.
    Worker,
}

impl NodeType {
    /// Upper-case name, as written into heartbeat records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Master => "MASTER",
            Self::Worker => "WORKER",
        }
    }

    /// Subtree under which nodes of this type register.
    #[must_use]
    pub const fn registry_root(self) -> &'static str {
        match self {
            Self::Master => path::MASTERS_ROOT,
            Self::Worker => path::WORKERS_ROOT,
        }
    }

    pub(crate) const fn dead_marker_prefix(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a `host:port` string cannot be parsed.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum NodeAddressError {
    /// No `:` separator.
    #[error("missing port in node address '{0}'")]
    MissingPort(String),

    /// Empty host part.
    #[error("missing host in node address '{0}'")]
    MissingHost(String),

    /// Port is not a valid `u16`.
    #[error("invalid port in node address '{0}'")]
    InvalidPort(String),
}

/// `host:port` identity of a single process.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct NodeAddress {
    host: String,
    port: u16,
}

impl NodeAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host part of the address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part of the address.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = NodeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NodeAddressError::MissingPort(s.to_string()))?;

        if host.is_empty() {
            return Err(NodeAddressError::MissingHost(s.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| NodeAddressError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}
