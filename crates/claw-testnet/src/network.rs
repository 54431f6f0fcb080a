//! Per-run isolated bridge networks.

use std::sync::Arc;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, NetworkRequest};
use crate::error::{TestnetError, TestnetResult};
use crate::labels::{cleanup_labels, sanitize_name};
use crate::subnet::{SubnetAllocator, parse_used};

/// Prefix of every network this crate creates.
pub const NETWORK_PREFIX: &str = "claw-testnet";

/// Creation attempts when a parallel run claims the same subnet first.
const MAX_CREATE_ATTEMPTS: usize = 3;

/// The isolated network of one test run.
///
/// Shared read-only by every node of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    id: String,
    name: String,
    subnet: Ipv4Net,
    test_id: String,
}

impl Network {
    /// Engine network ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocated subnet.
    #[must_use]
    pub const fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Test identity carried as the cleanup label value.
    #[must_use]
    pub fn test_id(&self) -> &str {
        &self.test_id
    }
}

/// Creates one labeled bridge network per test run.
#[derive(Clone)]
pub struct NetworkProvisioner {
    engine: Arc<dyn ContainerEngine>,
    allocator: Option<SubnetAllocator>,
}

impl std::fmt::Debug for NetworkProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkProvisioner")
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

impl NetworkProvisioner {
    /// Provisioner drawing subnets from a fresh random base per network.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            allocator: None,
        }
    }

    /// Use a fixed allocator instead of a random base.
    #[must_use]
    pub fn with_allocator(mut self, allocator: SubnetAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Create the run's network.
    ///
    /// Lists the subnets in use, allocates a free `/24` and creates a bridge
    /// network carrying the cleanup label. A pool overlap caused by a parallel
    /// run is retried against a fresh listing.
    ///
    /// # Errors
    ///
    /// Every failure is returned as [`TestnetError::NetworkSetup`], which is
    /// setup-fatal.
    pub async fn create_network(&self, test_id: &str) -> TestnetResult<Network> {
        self.try_create(test_id)
            .await
            .map_err(|source| TestnetError::NetworkSetup {
                test_id: test_id.to_string(),
                source: Box::new(source),
            })
    }

    async fn try_create(&self, test_id: &str) -> TestnetResult<Network> {
        let allocator = self.allocator.unwrap_or_else(SubnetAllocator::randomized);
        let name = network_name(test_id);
        let labels = cleanup_labels(test_id);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let networks = self.engine.list_networks(None).await?;
            let used = parse_used(networks.iter().flat_map(|n| n.subnets.iter()));
            let subnet = allocator.find_available_subnet(&used)?;

            debug!(test_id = %test_id, subnet = %subnet, attempt, "creating test network");
            let request = NetworkRequest {
                name: name.clone(),
                subnet,
                labels: labels.clone(),
            };

            match self.engine.create_network(&request).await {
                Ok(id) => {
                    info!(test_id = %test_id, id = %id, name = %name, subnet = %subnet, "test network ready");
                    return Ok(Network {
                        id,
                        name,
                        subnet,
                        test_id: test_id.to_string(),
                    });
                }
                Err(e) if is_pool_overlap(&e) && attempt < MAX_CREATE_ATTEMPTS => {
                    warn!(test_id = %test_id, subnet = %subnet, error = %e, "subnet taken concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Name of a run's network: prefix, sanitized test identity, random suffix.
#[must_use]
pub fn network_name(test_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let id = sanitize_name(test_id);
    if id.is_empty() {
        format!("{NETWORK_PREFIX}-{}", &suffix[..8])
    } else {
        format!("{NETWORK_PREFIX}-{id}-{}", &suffix[..8])
    }
}

fn is_pool_overlap(err: &TestnetError) -> bool {
    match err {
        TestnetError::Engine { message, .. } | TestnetError::Conflict { message, .. } => {
            message.to_ascii_lowercase().contains("overlaps")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::labels::CLEANUP_LABEL;

    fn provisioner(engine: &Arc<MemoryEngine>, base: &str) -> NetworkProvisioner {
        NetworkProvisioner::new(engine.clone())
            .with_allocator(SubnetAllocator::parse(base).expect("valid base"))
    }

    #[tokio::test]
    async fn test_network_is_labeled_and_isolated() {
        let engine = Arc::new(MemoryEngine::new());
        engine
            .add_foreign_network("bridge", "10.30.0.0/24")
            .expect("foreign network");

        let network = provisioner(&engine, "10.30.0.0/16")
            .create_network("suite::test_one")
            .await
            .expect("should create network");

        assert_eq!(network.subnet(), "10.30.1.0/24".parse::<Ipv4Net>().expect("cidr"));
        assert!(network.name().starts_with("claw-testnet-suite-test-one-"));
        let labels = engine.network_labels(network.name()).expect("network exists");
        assert_eq!(
            labels.get(CLEANUP_LABEL).map(String::as_str),
            Some("suite::test_one")
        );
    }

    #[tokio::test]
    async fn test_parallel_runs_get_distinct_subnets() {
        let engine = Arc::new(MemoryEngine::new());
        let first = provisioner(&engine, "10.30.0.0/16")
            .create_network("a")
            .await
            .expect("first network");
        let second = provisioner(&engine, "10.30.0.0/16")
            .create_network("b")
            .await
            .expect("second network");

        assert_ne!(first.subnet(), second.subnet());
        assert_ne!(first.name(), second.name());
    }

    #[tokio::test]
    async fn test_overlap_race_is_retried() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_network_creates_with_overlap(2);

        let network = provisioner(&engine, "10.30.0.0/16")
            .create_network("racy")
            .await
            .expect("should succeed on third attempt");
        assert_eq!(network.test_id(), "racy");
    }

    #[tokio::test]
    async fn test_failure_is_setup_fatal() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_network_creates_with_overlap(5);

        let err = provisioner(&engine, "10.30.0.0/16")
            .create_network("doomed")
            .await
            .expect_err("should give up");
        assert!(err.is_setup_fatal());
        assert!(err.to_string().contains("doomed"));
    }
}
