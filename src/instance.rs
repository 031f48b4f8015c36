//! Service instances returned by discovery queries, and the addresses
//! derived from them.

use std::fmt;
use std::sync::Arc;
use tracing::{event, Level};

/// Result of a single health check attached to an instance.
///
/// Variants are ordered by severity, so the aggregate status of an instance
/// is the maximum over its checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
}

/// A single instance of a service, as reported by the discovery backend.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ServiceInstance {
    /// Backend-assigned identifier. Only used for diagnostics.
    pub id: String,

    /// Address the instance registered with. May be empty, in which case the
    /// node address is used.
    pub address: String,

    pub port: u16,

    /// Address of the node (agent) the instance is registered on.
    pub node_address: String,

    /// Status of every health check associated with the instance.
    pub checks: Vec<HealthStatus>,
}

impl ServiceInstance {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            id: String::new(),
            address: address.into(),
            port,
            node_address: String::new(),
            checks: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_node_address(mut self, node_address: impl Into<String>) -> Self {
        self.node_address = node_address.into();
        self
    }

    pub fn with_check(mut self, status: HealthStatus) -> Self {
        self.checks.push(status);
        self
    }

    /// The worst status over all checks. An instance without checks is
    /// passing.
    pub fn aggregated_status(&self) -> HealthStatus {
        self.checks
            .iter()
            .copied()
            .max()
            .unwrap_or(HealthStatus::Passing)
    }

    pub fn is_passing(&self) -> bool {
        self.aggregated_status() == HealthStatus::Passing
    }

    /// The `host:port` under which this instance is reachable.
    pub fn resolved_address(&self) -> ResolvedAddress {
        let host = if self.address.is_empty() {
            event!(
                Level::TRACE,
                id = %self.id,
                node_address = %self.node_address,
                "Instance has no address, using node address"
            );
            &self.node_address
        } else {
            &self.address
        };
        ResolvedAddress::from_host_port(host, self.port)
    }
}

/// A normalized `host:port` string.
///
/// Ordering is lexicographic over the string form.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct ResolvedAddress(Arc<str>);

impl ResolvedAddress {
    /// Joins a host and a port, bracketing IPv6 literals.
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let joined = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self(joined.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ResolvedAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl From<String> for ResolvedAddress {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for ResolvedAddress {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::borrow::Borrow<str> for ResolvedAddress {
    fn borrow(&self) -> &str {
        &self.0
    }
}
