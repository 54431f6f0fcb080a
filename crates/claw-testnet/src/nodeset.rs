//! Topology builder: a name-indexed set of nodes on one run network.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RetentionPolicy;
use crate::engine::ContainerEngine;
use crate::error::{TestnetError, TestnetResult};
use crate::group::{self, DEFAULT_MAX_CONCURRENCY};
use crate::lifecycle::RemoveOptions;
use crate::network::Network;
use crate::node::{NodeConfig, NodeHandle, NodeType, node_name};

/// Record of a node taken out of a set, enough to bring it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedNode {
    /// Node name.
    pub name: String,
    /// Node index.
    pub index: u64,
    /// Node type.
    pub node_type: NodeType,
    /// Volume left behind when retention kept it.
    pub volume_name: String,
}

#[derive(Default)]
struct Members {
    nodes: HashMap<String, Arc<NodeHandle>>,
    next_index: u64,
}

/// The nodes of one test run.
///
/// Indexes are allocated monotonically and never reused, so every name is
/// unique for the lifetime of the set even across removals.
pub struct NodeSet {
    engine: Arc<dyn ContainerEngine>,
    network: Network,
    retention: RetentionPolicy,
    max_concurrency: usize,
    members: Mutex<Members>,
}

impl std::fmt::Debug for NodeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members = self.members.lock();
        let mut names: Vec<&String> = members.nodes.keys().collect();
        names.sort();
        f.debug_struct("NodeSet")
            .field("network", &self.network.name())
            .field("nodes", &names)
            .field("next_index", &members.next_index)
            .finish_non_exhaustive()
    }
}

impl NodeSet {
    /// Empty set on `network`.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, network: Network) -> Self {
        Self {
            engine,
            network,
            retention: RetentionPolicy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            members: Mutex::new(Members::default()),
        }
    }

    /// Decide what node removal keeps.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Bound group operations.
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// The run network.
    #[must_use]
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Test identity of the run.
    #[must_use]
    pub fn test_id(&self) -> &str {
        self.network.test_id()
    }

    /// Materialize a new node; it is not started.
    ///
    /// The index is consumed even when materialization fails.
    ///
    /// # Errors
    ///
    /// Returns the volume or container creation error.
    pub async fn add_node(&self, config: NodeConfig) -> TestnetResult<Arc<NodeHandle>> {
        let index = {
            let mut members = self.members.lock();
            let index = members.next_index;
            members.next_index += 1;
            index
        };
        let name = node_name(&config.node_type, index, self.test_id());
        debug!(node = %name, index, "adding node");

        self.materialize_and_insert(name, index, config).await
    }

    /// Bring a removed node back under its old name and index.
    ///
    /// Its volume is rebound when retention kept it, so data written before
    /// removal is visible again.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NodeExists`] if the name is taken,
    /// [`TestnetError::InvalidConfig`] if the node type differs, or the
    /// materialization error.
    pub async fn reattach(
        &self,
        removed: &RemovedNode,
        config: NodeConfig,
    ) -> TestnetResult<Arc<NodeHandle>> {
        if config.node_type != removed.node_type {
            return Err(TestnetError::InvalidConfig(format!(
                "cannot reattach {} as {}",
                removed.name, config.node_type
            )));
        }
        if self.members.lock().nodes.contains_key(&removed.name) {
            return Err(TestnetError::NodeExists {
                name: removed.name.clone(),
            });
        }
        info!(node = %removed.name, volume = %removed.volume_name, "reattaching node");

        self.materialize_and_insert(removed.name.clone(), removed.index, config)
            .await
    }

    async fn materialize_and_insert(
        &self,
        name: String,
        index: u64,
        config: NodeConfig,
    ) -> TestnetResult<Arc<NodeHandle>> {
        let node = Arc::new(
            NodeHandle::materialize(self.engine.clone(), &self.network, name, index, config)
                .await?,
        );

        let mut members = self.members.lock();
        if members.nodes.contains_key(node.name()) {
            return Err(TestnetError::NodeExists {
                name: node.name().to_string(),
            });
        }
        members
            .nodes
            .insert(node.name().to_string(), Arc::clone(&node));
        Ok(node)
    }

    /// Stop and remove the named nodes.
    ///
    /// All names are validated before anything happens. The set only changes
    /// once every named node stopped; their resources are then removed per
    /// the retention policy.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NodesNotFound`] naming every unknown node, the
    /// first stop failure (set unchanged), or the first removal failure.
    pub async fn remove_nodes(
        &self,
        names: &[&str],
        cancel: &CancellationToken,
    ) -> TestnetResult<Vec<RemovedNode>> {
        let targets = self.lookup_all(names)?;

        group::stop_all(&targets, cancel, self.max_concurrency).await?;

        {
            let mut members = self.members.lock();
            for node in &targets {
                members.nodes.remove(node.name());
            }
        }

        let opts = RemoveOptions::from_policy(&self.retention);
        group::remove_all(&targets, opts, self.max_concurrency).await?;
        info!(count = targets.len(), keep_volumes = opts.keep_volume, "nodes removed");

        Ok(targets
            .iter()
            .map(|node| RemovedNode {
                name: node.name().to_string(),
                index: node.index(),
                node_type: node.node_type().clone(),
                volume_name: node.volume_name().to_string(),
            })
            .collect())
    }

    fn lookup_all(&self, names: &[&str]) -> TestnetResult<Vec<Arc<NodeHandle>>> {
        let members = self.members.lock();
        let mut missing = Vec::new();
        let mut found: Vec<Arc<NodeHandle>> = Vec::new();
        for name in names {
            match members.nodes.get(*name) {
                Some(node) if !found.iter().any(|n| n.name() == *name) => {
                    found.push(Arc::clone(node));
                }
                Some(_) => {}
                None => missing.push((*name).to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(TestnetError::NodesNotFound { names: missing });
        }
        found.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(found)
    }

    /// Node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<Arc<NodeHandle>> {
        self.members.lock().nodes.get(name).cloned()
    }

    /// All nodes, sorted by name.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<NodeHandle>> {
        let mut nodes: Vec<_> = self.members.lock().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    /// Nodes of one type, sorted by name.
    #[must_use]
    pub fn nodes_by_type(&self, node_type: &NodeType) -> Vec<Arc<NodeHandle>> {
        let mut nodes: Vec<_> = self
            .members
            .lock()
            .nodes
            .values()
            .filter(|n| n.node_type() == node_type)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.lock().nodes.len()
    }

    /// Whether the set has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.lock().nodes.is_empty()
    }

    /// Start every node, failing fast.
    ///
    /// # Errors
    ///
    /// Returns the first start failure.
    pub async fn start_all(&self, cancel: &CancellationToken) -> TestnetResult<()> {
        group::start_all(&self.nodes(), cancel, self.max_concurrency).await
    }

    /// Stop every node, best-effort.
    ///
    /// # Errors
    ///
    /// Returns the first failure by node name after all stops finished.
    pub async fn stop_all(&self, cancel: &CancellationToken) -> TestnetResult<()> {
        group::stop_all(&self.nodes(), cancel, self.max_concurrency).await
    }

    /// Remove every node and its resources, best-effort.
    ///
    /// # Errors
    ///
    /// Returns the first failure by node name after all removals finished.
    pub async fn remove_all(&self) -> TestnetResult<()> {
        let nodes: Vec<_> = {
            let mut members = self.members.lock();
            let mut nodes: Vec<_> = members.nodes.drain().map(|(_, n)| n).collect();
            nodes.sort_by(|a, b| a.name().cmp(b.name()));
            nodes
        };
        let opts = RemoveOptions::from_policy(&self.retention);
        group::remove_all(&nodes, opts, self.max_concurrency).await
    }
}
