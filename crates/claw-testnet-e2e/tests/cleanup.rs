//! End-to-end tests for label-driven teardown.
//!
//! These tests verify:
//! 1. Setup removes orphans of an interrupted run with the same identity
//! 2. Failed runs can keep their volumes
//! 3. Container logs are persisted to a directory

mod helpers;

use claw_testnet::cleanup::log_path;
use claw_testnet::{
    CleanupSweeper, LogPolicy, NodeType, RetentionPolicy, SweepConfig, TestEnvironment,
    TestOutcome,
};
use helpers::{engine, http_node, init_tracing, unique_test_id};
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore = "requires Docker daemon"]
async fn test_setup_sweeps_interrupted_run() {
    init_tracing();
    let engine = engine().await;
    let test_id = unique_test_id("orphans");
    let config = SweepConfig::default().with_log_policy(LogPolicy::Never);

    let interrupted = TestEnvironment::setup(engine.clone(), &test_id, config.clone())
        .await
        .expect("first setup");
    interrupted
        .nodes()
        .add_node(http_node(NodeType::Validator))
        .await
        .expect("add");
    interrupted
        .nodes()
        .start_all(&CancellationToken::new())
        .await
        .expect("start");
    let stale = interrupted.network().name().to_string();
    // simulate a crashed test: no teardown
    drop(interrupted);

    let env = TestEnvironment::setup(engine.clone(), &test_id, config)
        .await
        .expect("second setup");
    let networks = engine
        .list_networks(Some(claw_testnet::labels::cleanup_filter(&test_id).as_str()))
        .await
        .expect("list networks");
    assert!(networks.iter().all(|n| n.name != stale));
    assert_eq!(networks.len(), 1);

    let report = env.teardown(TestOutcome::Passed).await;
    assert!(report.is_clean(), "teardown errors: {:?}", report.errors);
}

#[tokio::test]
#[ignore = "requires Docker daemon"]
async fn test_failed_run_keeps_volumes() {
    init_tracing();
    let engine = engine().await;
    let test_id = unique_test_id("keep_volumes");
    let config = SweepConfig::default()
        .with_log_policy(LogPolicy::Never)
        .with_retention(RetentionPolicy::default().with_keep_volumes_on_failure(true));

    let env = TestEnvironment::setup(engine.clone(), &test_id, config)
        .await
        .expect("setup");
    env.nodes()
        .add_node(http_node(NodeType::Validator))
        .await
        .expect("add");
    env.teardown(TestOutcome::Failed).await;

    let filter = claw_testnet::labels::cleanup_filter(&test_id);
    let volumes = engine.list_volumes(&filter).await.expect("list volumes");
    assert_eq!(volumes.len(), 1);

    // a second sweep with default retention removes them
    CleanupSweeper::new(engine.clone(), SweepConfig::default())
        .sweep_orphans(&test_id)
        .await;
    assert!(engine.list_volumes(&filter).await.expect("list").is_empty());
}

#[tokio::test]
#[ignore = "requires Docker daemon"]
async fn test_logs_written_to_directory() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let test_id = unique_test_id("log_dir");
    let config = SweepConfig::default()
        .with_log_policy(LogPolicy::Always)
        .with_log_dir(dir.path());

    let env = TestEnvironment::setup(engine().await, &test_id, config)
        .await
        .expect("setup");
    let node = env
        .nodes()
        .add_node(http_node(NodeType::Validator))
        .await
        .expect("add");
    node.start(&CancellationToken::new()).await.expect("start");
    let name = node.name().to_string();
    drop(node);

    let report = env.teardown(TestOutcome::Passed).await;
    let path = log_path(dir.path(), &test_id, &name);
    assert!(report.log_files.contains(&path));
    assert!(path.exists());
}
