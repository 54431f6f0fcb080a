//! # claw-testnet
//!
//! Ephemeral multi-node container topologies for Clawbernetes integration
//! tests.
//!
//! Every test run gets its own bridge network on a free `/24`, a set of
//! nodes each owning one container and one named volume, engine-assigned
//! host ports looked up by name, readiness gating, and a label-driven
//! teardown that also removes what interrupted runs left behind.
//!
//! ## Example
//!
//! ```rust,ignore
//! use claw_testnet::{
//!     HttpHealthProbe, NodeConfig, NodeType, PortTable, TestEnvironment, TestOutcome,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let env = TestEnvironment::connect("consensus::three_validators").await?;
//! for _ in 0..3 {
//!     env.nodes()
//!         .add_node(
//!             NodeConfig::new(NodeType::Validator, "ghcr.io/example/chain:v1")
//!                 .with_ports(PortTable::new().with("rpc", 26657))
//!                 .with_readiness(HttpHealthProbe::new("rpc", "/health")),
//!         )
//!         .await?;
//! }
//! env.nodes().start_all(&CancellationToken::new()).await?;
//! let rpc = env.nodes().nodes()[0].host_port("rpc")?;
//! // ... drive the test against `rpc` ...
//! env.teardown(TestOutcome::Passed).await;
//! ```
//!
//! ## Layout
//!
//! ```text
//! TestEnvironment ── CleanupSweeper (labels, prune, log dumps)
//!        │
//!        ├── NetworkProvisioner ── SubnetAllocator
//!        │
//!        └── NodeSet ── group (start_all / stop_all / remove_all)
//!               │
//!               └── NodeHandle ── NodeResources (volume, container, files, exec)
//!                        ├── PortResolver
//!                        └── ReadinessGate + ReadinessProbe
//!                                 │
//!                          ContainerEngine (DockerEngine | MemoryEngine)
//! ```
//!
//! ## Features
//!
//! - `test-util` - in-memory [`engine::MemoryEngine`] for Docker-free tests

#![warn(missing_docs)]

pub mod archive;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod group;
pub mod labels;
pub mod lifecycle;
pub mod network;
pub mod node;
pub mod nodeset;
pub mod ports;
pub mod readiness;
pub mod subnet;

// Re-exports
pub use cleanup::{CleanupCallback, CleanupSweeper, SweepReport};
pub use config::{
    EngineConfig, EngineEndpoint, LogPolicy, PruneRetry, RetentionPolicy, SweepConfig,
    TestOutcome,
};
pub use engine::{ContainerEngine, ContainerState, DockerEngine, Mount, PullPolicy};
pub use environment::TestEnvironment;
pub use error::{ResourceKind, TestnetError, TestnetResult};
pub use labels::CLEANUP_LABEL;
pub use lifecycle::{NodeResources, RemoveOptions};
pub use network::{Network, NetworkProvisioner};
pub use node::{NodeConfig, NodeHandle, NodeType};
pub use nodeset::{NodeSet, RemovedNode};
pub use ports::{HostPorts, PortResolver, PortSpec, PortTable, Protocol};
pub use readiness::{
    HttpHealthProbe, ReadinessGate, ReadinessProbe, RpcCallProbe, RpcStatusProbe, TcpProbe,
};
pub use subnet::SubnetAllocator;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
