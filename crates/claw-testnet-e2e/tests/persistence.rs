//! End-to-end tests for node volumes.
//!
//! These tests verify:
//! 1. Files written through helpers are visible inside the node
//! 2. A reattached node rebinds its preserved volume
//! 3. Host-mediated copies between nodes
//! 4. Failed execs report exit code and output

mod helpers;

use claw_testnet::{
    NodeType, RetentionPolicy, SweepConfig, TestEnvironment, TestOutcome, TestnetError,
};
use helpers::{engine, http_node, init_tracing, unique_test_id};
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore = "requires Docker daemon"]
async fn test_written_file_is_visible_in_container() {
    let env = helpers::environment("write_file").await;
    let cancel = CancellationToken::new();

    let node = env
        .nodes()
        .add_node(http_node(NodeType::Validator))
        .await
        .expect("add");
    node.write_file("config/app.toml", b"moniker = \"val-0\"\n")
        .await
        .expect("write");
    node.start(&cancel).await.expect("start");

    let (stdout, _) = node
        .exec(
            &cancel,
            ["cat", "/home/node/config/app.toml"],
            Vec::<String>::new(),
        )
        .await
        .expect("cat");
    assert_eq!(stdout, "moniker = \"val-0\"\n");

    env.teardown(TestOutcome::Passed).await;
}

#[tokio::test]
#[ignore = "requires Docker daemon"]
async fn test_reattach_rebinds_preserved_volume() {
    init_tracing();
    let config = SweepConfig::from_env().with_retention(RetentionPolicy::preserve_volumes());
    let env = TestEnvironment::setup(engine().await, &unique_test_id("reattach"), config)
        .await
        .expect("setup");
    let cancel = CancellationToken::new();

    let node = env
        .nodes()
        .add_node(http_node(NodeType::Validator))
        .await
        .expect("add");
    node.start(&cancel).await.expect("start");
    node.exec(
        &cancel,
        ["sh", "-c", "echo 42 > /home/node/height"],
        Vec::<String>::new(),
    )
    .await
    .expect("write height");
    let name = node.name().to_string();
    drop(node);

    let removed = env
        .nodes()
        .remove_nodes(&[name.as_str()], &cancel)
        .await
        .expect("remove");
    assert!(env.nodes().is_empty());

    let node = env
        .nodes()
        .reattach(&removed[0], http_node(NodeType::Validator))
        .await
        .expect("reattach");
    assert_eq!(node.name(), name);
    assert_eq!(node.read_file("height").await.expect("read"), b"42\n".to_vec());

    env.teardown(TestOutcome::Passed).await;
}

#[tokio::test]
#[ignore = "requires Docker daemon"]
async fn test_copy_file_between_nodes() {
    let env = helpers::environment("copy_file").await;

    let source = env
        .nodes()
        .add_node(http_node(NodeType::Validator))
        .await
        .expect("source");
    let dest = env
        .nodes()
        .add_node(http_node(NodeType::FullNode))
        .await
        .expect("dest");

    source
        .write_file("config/genesis.json", b"{\"chain_id\":\"e2e\"}")
        .await
        .expect("write");
    source
        .copy_file_to(&dest, "config/genesis.json", "config/genesis.json")
        .await
        .expect("copy");
    assert_eq!(
        dest.read_file("config/genesis.json").await.expect("read"),
        b"{\"chain_id\":\"e2e\"}".to_vec()
    );

    env.teardown(TestOutcome::Passed).await;
}

#[tokio::test]
#[ignore = "requires Docker daemon"]
async fn test_failed_exec_carries_output() {
    let env = helpers::environment("exec_failure").await;
    let cancel = CancellationToken::new();

    let node = env
        .nodes()
        .add_node(http_node(NodeType::Validator))
        .await
        .expect("add");
    node.start(&cancel).await.expect("start");

    let err = node
        .exec(
            &cancel,
            ["sh", "-c", "echo out; echo err >&2; exit 3"],
            Vec::<String>::new(),
        )
        .await
        .expect_err("non-zero exit");
    assert!(matches!(
        &err,
        TestnetError::ExecFailed { exit_code: 3, stdout, stderr, .. }
            if stdout.trim() == "out" && stderr.trim() == "err"
    ));

    env.teardown(TestOutcome::Failed).await;
}
