//! Node flavors, node configuration and node handles.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{ContainerDetails, ContainerEngine, ContainerState, Mount, PullPolicy};
use crate::error::{TestnetError, TestnetResult};
use crate::labels::{condense_hostname, sanitize_name};
use crate::lifecycle::{ContainerParams, DEFAULT_HELPER_IMAGE, NodeResources, RemoveOptions};
use crate::network::Network;
use crate::ports::{HostPorts, PortTable};
use crate::readiness::{ReadinessGate, ReadinessProbe};

/// Default home directory the node volume is mounted at.
pub const DEFAULT_HOME_DIR: &str = "/home/node";

/// Default graceful stop timeout.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Role of a node in a topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Consensus validator.
    Validator,
    /// Non-validating full node.
    FullNode,
    /// Data-availability bridge node.
    Bridge,
    /// Light node.
    Light,
    /// Rollup aggregator.
    Aggregator,
    /// Rollup sequencer.
    Sequencer,
    /// Execution-layer client.
    Execution,
    /// Cross-chain relayer.
    Relayer,
    /// Tracing or metrics collector.
    Collector,
    /// Any other flavor, named by the caller.
    Custom(String),
}

impl NodeType {
    /// Short discriminator used in node names.
    #[must_use]
    pub fn discriminator(&self) -> String {
        match self {
            Self::Validator => "val".to_string(),
            Self::FullNode => "full".to_string(),
            Self::Bridge => "bridge".to_string(),
            Self::Light => "light".to_string(),
            Self::Aggregator => "agg".to_string(),
            Self::Sequencer => "seq".to_string(),
            Self::Execution => "exec".to_string(),
            Self::Relayer => "relayer".to_string(),
            Self::Collector => "collector".to_string(),
            Self::Custom(name) => sanitize_name(name),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.discriminator())
    }
}

/// Name of a node: type discriminator, index, sanitized test identity.
#[must_use]
pub fn node_name(node_type: &NodeType, index: u64, test_id: &str) -> String {
    let id = sanitize_name(test_id);
    if id.is_empty() {
        format!("{}-{index}", node_type.discriminator())
    } else {
        format!("{}-{index}-{id}", node_type.discriminator())
    }
}

/// Everything a node flavor supplies to materialize a node.
#[derive(Clone)]
pub struct NodeConfig {
    /// Node type.
    pub node_type: NodeType,
    /// Image reference.
    pub image: String,
    /// Pull behavior.
    pub pull_policy: PullPolicy,
    /// Command override.
    pub cmd: Option<Vec<String>>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Environment (`KEY=VALUE`).
    pub env: Vec<String>,
    /// Declared ports.
    pub ports: PortTable,
    /// Where the node volume is mounted.
    pub home_dir: String,
    /// `uid:gid` the container runs as and the volume is owned by.
    pub user: Option<String>,
    /// Additional mounts.
    pub extra_mounts: Vec<Mount>,
    /// Readiness check run after every start.
    pub readiness: Option<Arc<dyn ReadinessProbe>>,
    /// Readiness timing.
    pub gate: ReadinessGate,
    /// Graceful stop timeout.
    pub stop_timeout: Duration,
    /// Image of the helper containers used for volume access.
    pub helper_image: String,
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("node_type", &self.node_type)
            .field("image", &self.image)
            .field("cmd", &self.cmd)
            .field("ports", &self.ports)
            .field("home_dir", &self.home_dir)
            .field("readiness", &self.readiness)
            .finish_non_exhaustive()
    }
}

impl NodeConfig {
    /// Configuration for a node type running `image`.
    #[must_use]
    pub fn new(node_type: NodeType, image: impl Into<String>) -> Self {
        Self {
            node_type,
            image: image.into(),
            pull_policy: PullPolicy::default(),
            cmd: None,
            entrypoint: None,
            env: Vec::new(),
            ports: PortTable::new(),
            home_dir: DEFAULT_HOME_DIR.to_string(),
            user: None,
            extra_mounts: Vec::new(),
            readiness: None,
            gate: ReadinessGate::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            helper_image: DEFAULT_HELPER_IMAGE.to_string(),
        }
    }

    /// Set the command.
    #[must_use]
    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    /// Set the entrypoint.
    #[must_use]
    pub fn with_entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(entrypoint.into_iter().map(Into::into).collect());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env
            .push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    /// Set the port table.
    #[must_use]
    pub fn with_ports(mut self, ports: PortTable) -> Self {
        self.ports = ports;
        self
    }

    /// Set the home directory.
    #[must_use]
    pub fn with_home_dir(mut self, dir: impl Into<String>) -> Self {
        self.home_dir = dir.into();
        self
    }

    /// Run as `uid:gid`.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Add a mount.
    #[must_use]
    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.extra_mounts.push(mount);
        self
    }

    /// Gate every start on a readiness probe.
    #[must_use]
    pub fn with_readiness(mut self, probe: impl ReadinessProbe + 'static) -> Self {
        self.readiness = Some(Arc::new(probe));
        self
    }

    /// Set readiness timing.
    #[must_use]
    pub fn with_gate(mut self, gate: ReadinessGate) -> Self {
        self.gate = gate;
        self
    }

    /// Set the graceful stop timeout.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the pull policy.
    #[must_use]
    pub fn with_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Use a different helper image.
    #[must_use]
    pub fn with_helper_image(mut self, image: impl Into<String>) -> Self {
        self.helper_image = image.into();
        self
    }

    fn container_params(&self) -> ContainerParams {
        ContainerParams {
            image: self.image.clone(),
            pull_policy: self.pull_policy,
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            env: self.env.clone(),
            ports: self.ports.clone(),
            extra_mounts: self.extra_mounts.clone(),
        }
    }
}

/// A materialized node of a topology.
pub struct NodeHandle {
    name: String,
    index: u64,
    hostname: String,
    network: Network,
    config: NodeConfig,
    resources: NodeResources,
    host_ports: RwLock<Option<HostPorts>>,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("node_type", &self.config.node_type)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl NodeHandle {
    /// Create the node's volume and container without starting it.
    ///
    /// # Errors
    ///
    /// Returns error if the volume or container cannot be created.
    pub async fn materialize(
        engine: Arc<dyn ContainerEngine>,
        network: &Network,
        name: String,
        index: u64,
        config: NodeConfig,
    ) -> TestnetResult<Self> {
        let mut resources =
            NodeResources::new(engine, network.test_id(), &name, &config.home_dir)
                .with_helper_image(&config.helper_image);
        if let Some(ref user) = config.user {
            resources = resources.with_user(user);
        }

        resources.create_and_setup_volume().await?;
        resources
            .create_container(network, &config.container_params())
            .await?;
        info!(node = %name, index, node_type = %config.node_type, "node materialized");

        Ok(Self {
            hostname: condense_hostname(&name),
            name,
            index,
            network: network.clone(),
            config,
            resources,
            host_ports: RwLock::new(None),
        })
    }

    /// Unique node name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index the name was built from.
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Node type.
    #[must_use]
    pub fn node_type(&self) -> &NodeType {
        &self.config.node_type
    }

    /// Hostname on the run network.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The run network.
    #[must_use]
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Node configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Volume name.
    #[must_use]
    pub fn volume_name(&self) -> &str {
        self.resources.volume_name()
    }

    /// Container ID while a container exists.
    #[must_use]
    pub fn container_id(&self) -> Option<String> {
        self.resources.container_id()
    }

    /// Start the node, resolve its host ports and wait until it is ready.
    ///
    /// # Errors
    ///
    /// Returns the start, port resolution or readiness error;
    /// [`TestnetError::Cancelled`] if `cancel` fires.
    pub async fn start(&self, cancel: &CancellationToken) -> TestnetResult<()> {
        if cancel.is_cancelled() {
            return Err(TestnetError::Cancelled(format!("start of {}", self.name)));
        }

        self.resources.start().await?;
        let ports = self.resources.host_ports(&self.config.ports).await?;
        *self.host_ports.write() = Some(ports.clone());

        if let Some(ref probe) = self.config.readiness {
            let probe: &dyn ReadinessProbe = probe.as_ref();
            let ports = &ports;
            self.config
                .gate
                .wait_ready(&self.name, cancel, move || probe.check(ports))
                .await?;
        }

        info!(node = %self.name, "node ready");
        Ok(())
    }

    /// Stop the node; it can be started again.
    ///
    /// # Errors
    ///
    /// Returns the stop error, [`TestnetError::StopTimeout`] or
    /// [`TestnetError::Cancelled`].
    pub async fn stop(&self, cancel: &CancellationToken) -> TestnetResult<()> {
        let result = self.resources.stop(cancel, self.config.stop_timeout).await;
        // a cancelled stop force-removes the container
        if result.is_ok() || self.resources.container_id().is_none() {
            self.host_ports.write().take();
        }
        result
    }

    /// Stop and start again, re-resolving host ports.
    ///
    /// # Errors
    ///
    /// Returns the first stop or start error.
    pub async fn restart(&self, cancel: &CancellationToken) -> TestnetResult<()> {
        self.stop(cancel).await?;
        self.start(cancel).await
    }

    /// Remove the container and, unless kept, the volume.
    ///
    /// # Errors
    ///
    /// Returns the first engine error other than not-found.
    pub async fn remove(&self, opts: RemoveOptions) -> TestnetResult<()> {
        self.host_ports.write().take();
        self.resources.remove(opts).await
    }

    /// Run a command in the node's container.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::ExecFailed`] on a non-zero exit, carrying both
    /// streams.
    pub async fn exec<C, E>(
        &self,
        cancel: &CancellationToken,
        cmd: C,
        env: E,
    ) -> TestnetResult<(String, String)>
    where
        C: IntoIterator,
        C::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let cmd: Vec<String> = cmd.into_iter().map(Into::into).collect();
        let env: Vec<String> = env.into_iter().map(Into::into).collect();
        debug!(node = %self.name, cmd = ?cmd, "exec");
        self.resources.exec(cancel, cmd, env).await
    }

    /// Read a file relative to the node volume.
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or the helper fails.
    pub async fn read_file(&self, rel_path: &str) -> TestnetResult<Vec<u8>> {
        self.resources.read_file(rel_path).await
    }

    /// Write a file relative to the node volume.
    ///
    /// # Errors
    ///
    /// Returns error if the helper fails.
    pub async fn write_file(&self, rel_path: &str, contents: &[u8]) -> TestnetResult<()> {
        self.resources.write_file(rel_path, contents).await
    }

    /// Copy a file from this node's volume into another node's volume.
    ///
    /// # Errors
    ///
    /// Returns the read or write error.
    pub async fn copy_file_to(
        &self,
        other: &NodeHandle,
        src_rel: &str,
        dst_rel: &str,
    ) -> TestnetResult<()> {
        let contents = self.read_file(src_rel).await?;
        other.write_file(dst_rel, &contents).await?;
        debug!(from = %self.name, to = %other.name, src = %src_rel, dst = %dst_rel, "copied file");
        Ok(())
    }

    /// Container logs, optionally only the last `tail` lines.
    ///
    /// # Errors
    ///
    /// Returns error if no container exists.
    pub async fn logs(&self, tail: Option<usize>) -> TestnetResult<String> {
        self.resources.logs(tail).await
    }

    /// Current container state.
    ///
    /// # Errors
    ///
    /// Returns error if no container exists.
    pub async fn state(&self) -> TestnetResult<ContainerState> {
        self.resources.state().await
    }

    /// Inspect the container.
    ///
    /// # Errors
    ///
    /// Returns error if no container exists.
    pub async fn inspect(&self) -> TestnetResult<ContainerDetails> {
        self.resources.inspect().await
    }

    /// Host ports resolved by the last start, if the node is running.
    #[must_use]
    pub fn host_ports(&self) -> Option<HostPorts> {
        self.host_ports.read().clone()
    }

    /// Host address of a named port.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NotRunning`] before start or after stop, or
    /// [`TestnetError::UnknownPort`].
    pub fn host_port(&self, name: &str) -> TestnetResult<String> {
        let guard = self.host_ports.read();
        let ports = guard.as_ref().ok_or_else(|| TestnetError::NotRunning {
            node: self.name.clone(),
            state: "not started".to_string(),
        })?;
        ports.require(name).map(str::to_string)
    }

    /// Address of a named port as seen from other nodes on the run network.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::UnknownPort`] if the port is not declared.
    pub fn internal_address(&self, port_name: &str) -> TestnetResult<String> {
        let spec = self
            .config
            .ports
            .get(port_name)
            .ok_or_else(|| TestnetError::UnknownPort(port_name.to_string()))?;
        Ok(format!("{}:{}", self.hostname, spec.port))
    }
}
