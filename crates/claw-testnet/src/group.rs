//! Bounded fan-out of node operations.
//!
//! Two flavors: [`start_all`] is fail-fast and drops the remaining starts on
//! the first error, while [`stop_all`] and [`remove_all`] are best-effort and
//! attempt every node before reporting.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{TestnetError, TestnetResult};
use crate::lifecycle::RemoveOptions;
use crate::node::NodeHandle;

/// Default number of nodes operated on at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Start every node, at most `max_concurrency` at a time.
///
/// # Errors
///
/// Returns the first start failure; starts still in flight are dropped.
pub async fn start_all(
    nodes: &[Arc<NodeHandle>],
    cancel: &CancellationToken,
    max_concurrency: usize,
) -> TestnetResult<()> {
    stream::iter(nodes.iter().map(Ok::<_, TestnetError>))
        .try_for_each_concurrent(max_concurrency.max(1), |node| async move {
            node.start(cancel).await.inspect_err(|e| {
                warn!(node = %node.name(), error = %e, "node failed to start");
            })
        })
        .await?;
    info!(count = nodes.len(), "nodes started");
    Ok(())
}

/// Stop every node, continuing past failures.
///
/// # Errors
///
/// Returns the failure of the first node by name after all stops finished.
pub async fn stop_all(
    nodes: &[Arc<NodeHandle>],
    cancel: &CancellationToken,
    max_concurrency: usize,
) -> TestnetResult<()> {
    best_effort(nodes, max_concurrency, "stop", |node| async move {
        node.stop(cancel).await
    })
    .await
}

/// Remove every node's resources, continuing past failures.
///
/// # Errors
///
/// Returns the failure of the first node by name after all removals finished.
pub async fn remove_all(
    nodes: &[Arc<NodeHandle>],
    opts: RemoveOptions,
    max_concurrency: usize,
) -> TestnetResult<()> {
    best_effort(nodes, max_concurrency, "remove", |node| async move {
        node.remove(opts).await
    })
    .await
}

async fn best_effort<'a, F, Fut>(
    nodes: &'a [Arc<NodeHandle>],
    max_concurrency: usize,
    operation: &'static str,
    op: F,
) -> TestnetResult<()>
where
    F: Fn(&'a NodeHandle) -> Fut,
    Fut: Future<Output = TestnetResult<()>> + 'a,
{
    let mut results: Vec<(&str, TestnetResult<()>)> = stream::iter(nodes)
        .map(|node| {
            let fut = op(node.as_ref());
            async move { (node.name(), fut.await) }
        })
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await;
    results.sort_by(|a, b| a.0.cmp(b.0));

    let mut first = None;
    for (name, result) in results {
        if let Err(e) = result {
            warn!(node = %name, operation, error = %e, "group operation failed");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::engine::{ContainerEngine, ContainerState, MemoryEngine};
    use crate::network::{Network, NetworkProvisioner};
    use crate::node::{NodeConfig, NodeType, node_name};
    use crate::subnet::SubnetAllocator;

    async fn topology(engine: &Arc<MemoryEngine>, count: u64) -> Vec<Arc<NodeHandle>> {
        let network: Network = NetworkProvisioner::new(engine.clone())
            .with_allocator(SubnetAllocator::parse("10.70.0.0/16").expect("base"))
            .create_network("group")
            .await
            .expect("should create network");

        let mut nodes = Vec::new();
        for index in 0..count {
            let config = NodeConfig::new(NodeType::Validator, "ghcr.io/example/app:v1")
                .with_stop_timeout(Duration::from_secs(1));
            let node = NodeHandle::materialize(
                engine.clone(),
                &network,
                node_name(&NodeType::Validator, index, "group"),
                index,
                config,
            )
            .await
            .expect("should materialize");
            nodes.push(Arc::new(node));
        }
        nodes
    }

    #[tokio::test]
    async fn test_start_all_starts_every_node() {
        let engine = Arc::new(MemoryEngine::new());
        let nodes = topology(&engine, 4).await;

        start_all(&nodes, &CancellationToken::new(), 2)
            .await
            .expect("should start all");
        assert_eq!(engine.running_container_names().len(), 4);
    }

    #[tokio::test]
    async fn test_start_all_fails_fast() {
        let engine = Arc::new(MemoryEngine::new());
        let nodes = topology(&engine, 3).await;
        engine.fail_start_of("val-1-group");

        let err = start_all(&nodes, &CancellationToken::new(), 1)
            .await
            .expect_err("one start fails");
        assert!(err.to_string().contains("injected start failure for val-1-group"));

        // sequential fan-out never reaches the third node
        let state = nodes[2].state().await.expect("state");
        assert_eq!(state, ContainerState::Created);
    }

    #[tokio::test]
    async fn test_stop_all_is_best_effort() {
        let engine = Arc::new(MemoryEngine::new());
        let nodes = topology(&engine, 3).await;
        let cancel = CancellationToken::new();
        start_all(&nodes, &cancel, DEFAULT_MAX_CONCURRENCY)
            .await
            .expect("start");

        // a container removed behind the node's back fails its stop,
        // the others still stop
        engine
            .remove_container(nodes[0].name(), true)
            .await
            .expect("remove first");
        let err = stop_all(&nodes, &cancel, DEFAULT_MAX_CONCURRENCY)
            .await
            .expect_err("first node's container is gone");
        assert!(err.is_not_found());
        assert!(engine.running_container_names().is_empty());
    }

    #[tokio::test]
    async fn test_remove_all_keeps_volumes_when_asked() {
        let engine = Arc::new(MemoryEngine::new());
        let nodes = topology(&engine, 2).await;

        remove_all(
            &nodes,
            RemoveOptions::default().with_keep_volume(true),
            DEFAULT_MAX_CONCURRENCY,
        )
        .await
        .expect("remove");
        assert!(engine.container_names().is_empty());
        assert_eq!(engine.volume_names().len(), 2);
    }
}
