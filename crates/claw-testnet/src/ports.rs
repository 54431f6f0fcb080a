//! Port declarations and host-port discovery.
//!
//! A node declares its ports once, in a [`PortTable`]. The same table drives
//! the port publishing at container creation and the lookup of the
//! engine-assigned host ports after start, so the two can never disagree.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{ContainerDetails, ContainerEngine, HostBinding};
use crate::error::{TestnetError, TestnetResult};

/// Transport protocol of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Protocol name as used in engine port specs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named container port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSpec {
    /// Name callers look the port up by (`rpc`, `grpc`, ...).
    pub name: String,
    /// Container-side port.
    pub port: u16,
    /// Protocol.
    pub protocol: Protocol,
}

impl PortSpec {
    /// Engine port spec, e.g. `26657/tcp`.
    #[must_use]
    pub fn engine_spec(&self) -> String {
        format!("{}/{}", self.port, self.protocol)
    }
}

/// Ordered set of named ports a node exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTable {
    ports: Vec<PortSpec>,
}

impl PortTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a TCP port; a repeated name replaces the earlier entry.
    #[must_use]
    pub fn with(self, name: impl Into<String>, port: u16) -> Self {
        self.with_protocol(name, port, Protocol::Tcp)
    }

    /// Add a UDP port.
    #[must_use]
    pub fn with_udp(self, name: impl Into<String>, port: u16) -> Self {
        self.with_protocol(name, port, Protocol::Udp)
    }

    /// Add a port with an explicit protocol.
    #[must_use]
    pub fn with_protocol(mut self, name: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        let name = name.into();
        self.ports.retain(|p| p.name != name);
        self.ports.push(PortSpec {
            name,
            port,
            protocol,
        });
        self
    }

    /// Look up a port by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PortSpec> {
        self.ports.iter().find(|p| p.name == name)
    }

    /// Iterate over declared ports in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &PortSpec> {
        self.ports.iter()
    }

    /// Engine port specs for container creation.
    #[must_use]
    pub fn engine_specs(&self) -> Vec<String> {
        self.ports.iter().map(PortSpec::engine_spec).collect()
    }

    /// Number of ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether no ports are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Host addresses (`127.0.0.1:49153`) keyed by port name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPorts {
    addrs: BTreeMap<String, String>,
}

impl HostPorts {
    /// Host address of a named port.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.addrs.get(name).map(String::as_str)
    }

    /// Host address of a named port, or an error naming it.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::UnknownPort`] if the name was not declared.
    pub fn require(&self, name: &str) -> TestnetResult<&str> {
        self.get(name)
            .ok_or_else(|| TestnetError::UnknownPort(name.to_string()))
    }

    /// Parsed socket address of a named port.
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown or the address is malformed.
    pub fn socket_addr(&self, name: &str) -> TestnetResult<SocketAddr> {
        let addr = self.require(name)?;
        addr.parse().map_err(|e: std::net::AddrParseError| {
            TestnetError::InvalidConfig(format!("bad host address {addr} for port {name}: {e}"))
        })
    }

    /// Iterate over `(name, address)` pairs, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.addrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of resolved ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl FromIterator<(String, String)> for HostPorts {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            addrs: iter.into_iter().collect(),
        }
    }
}

/// Looks up engine-assigned host ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortResolver;

impl PortResolver {
    /// Map every declared port to its host address from an inspect result.
    ///
    /// IPv4 bindings win over IPv6 ones; wildcard host IPs become loopback.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::PortNotBound`] for a declared port without a
    /// published binding.
    pub fn resolve(details: &ContainerDetails, table: &PortTable) -> TestnetResult<HostPorts> {
        table
            .iter()
            .map(|spec| {
                let engine_spec = spec.engine_spec();
                let binding = details
                    .ports
                    .get(&engine_spec)
                    .and_then(|bindings| pick_binding(bindings))
                    .ok_or_else(|| TestnetError::PortNotBound {
                        container: details.name.clone(),
                        port: engine_spec.clone(),
                    })?;
                Ok((spec.name.clone(), host_address(binding)))
            })
            .collect()
    }

    /// Inspect a running container and resolve its declared ports.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NotRunning`] unless the container is running,
    /// or any inspect or resolution failure.
    pub async fn host_ports(
        engine: &dyn ContainerEngine,
        container_id: &str,
        node: &str,
        table: &PortTable,
    ) -> TestnetResult<HostPorts> {
        let details = engine.inspect_container(container_id).await?;
        if !details.state.is_running() {
            return Err(TestnetError::NotRunning {
                node: node.to_string(),
                state: details.state.to_string(),
            });
        }
        let ports = Self::resolve(&details, table)?;
        debug!(node = %node, ports = ?ports, "resolved host ports");
        Ok(ports)
    }
}

fn pick_binding(bindings: &[HostBinding]) -> Option<&HostBinding> {
    let published = bindings.iter().filter(|b| !b.host_port.is_empty());
    published
        .clone()
        .find(|b| !b.host_ip.contains(':'))
        .or_else(|| published.clone().next())
}

fn host_address(binding: &HostBinding) -> String {
    let ip = match binding.host_ip.as_str() {
        "" | "0.0.0.0" | "::" => "127.0.0.1",
        ip => ip,
    };
    if ip.contains(':') {
        format!("[{ip}]:{}", binding.host_port)
    } else {
        format!("{ip}:{}", binding.host_port)
    }
}
