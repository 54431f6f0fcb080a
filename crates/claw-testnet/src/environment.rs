//! One test run's fixture: orphan sweep, isolated network, node set, teardown.

use std::sync::Arc;

use tracing::info;

use crate::cleanup::{CleanupCallback, CleanupSweeper, SweepReport};
use crate::config::{EngineConfig, SweepConfig, TestOutcome};
use crate::engine::{ContainerEngine, DockerEngine};
use crate::error::TestnetResult;
use crate::network::{Network, NetworkProvisioner};
use crate::nodeset::NodeSet;

/// Fixture owning everything a test run creates.
///
/// Dropping it does not clean up; call [`TestEnvironment::teardown`] or run
/// the [`TestEnvironment::cleanup_callback`] once the test outcome is known.
pub struct TestEnvironment {
    engine: Arc<dyn ContainerEngine>,
    sweeper: CleanupSweeper,
    nodes: NodeSet,
}

impl std::fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("sweeper", &self.sweeper)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

impl TestEnvironment {
    /// Connect to the local Docker daemon and set up with environment-driven
    /// teardown settings.
    ///
    /// # Errors
    ///
    /// Returns error if the daemon is unreachable or the network cannot be
    /// created.
    pub async fn connect(test_id: &str) -> TestnetResult<Self> {
        let engine = DockerEngine::connect(&EngineConfig::default()).await?;
        Self::setup(Arc::new(engine), test_id, SweepConfig::from_env()).await
    }

    /// Sweep orphans of `test_id`, then create the run network.
    ///
    /// # Errors
    ///
    /// Returns a setup-fatal error if the network cannot be created.
    pub async fn setup(
        engine: Arc<dyn ContainerEngine>,
        test_id: &str,
        config: SweepConfig,
    ) -> TestnetResult<Self> {
        let provisioner = NetworkProvisioner::new(engine.clone());
        Self::setup_with(engine, test_id, config, &provisioner).await
    }

    /// Like [`TestEnvironment::setup`] with a custom network provisioner.
    ///
    /// # Errors
    ///
    /// Returns a setup-fatal error if the network cannot be created.
    pub async fn setup_with(
        engine: Arc<dyn ContainerEngine>,
        test_id: &str,
        config: SweepConfig,
        provisioner: &NetworkProvisioner,
    ) -> TestnetResult<Self> {
        let sweeper = CleanupSweeper::new(engine.clone(), config.clone());
        sweeper.sweep_orphans(test_id).await;

        let network = provisioner.create_network(test_id).await?;
        let nodes = NodeSet::new(engine.clone(), network)
            .with_retention(config.retention)
            .with_max_concurrency(config.max_concurrency);
        info!(test_id = %test_id, network = %nodes.network().name(), "test environment ready");

        Ok(Self {
            engine,
            sweeper,
            nodes,
        })
    }

    /// Test identity.
    #[must_use]
    pub fn test_id(&self) -> &str {
        self.nodes.test_id()
    }

    /// The run network.
    #[must_use]
    pub fn network(&self) -> &Network {
        self.nodes.network()
    }

    /// The run's nodes.
    #[must_use]
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// Engine the run talks to.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Teardown callback that outlives the environment.
    #[must_use]
    pub fn cleanup_callback(&self) -> CleanupCallback {
        self.sweeper.cleanup(self.test_id())
    }

    /// Tear the run down.
    pub async fn teardown(self, outcome: TestOutcome) -> SweepReport {
        self.sweeper.sweep(self.nodes.test_id(), outcome).await
    }
}
