//! Test helpers for Docker-backed suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use claw_testnet::{
    ContainerEngine, DockerEngine, EngineConfig, HttpHealthProbe, LogPolicy, NodeConfig, NodeType,
    PortTable, ReadinessGate, SweepConfig, TestEnvironment,
};
use tracing_subscriber::EnvFilter;

/// Image every node runs.
pub const NODE_IMAGE: &str = "busybox:1.36";

/// Port the node HTTP server listens on inside the container.
pub const HTTP_PORT: u16 = 8080;

/// Install a tracing subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("claw_testnet=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Test identity unique to this invocation.
pub fn unique_test_id(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("e2e::{name}::{}", &suffix[..8])
}

/// Connect to the local daemon.
pub async fn engine() -> Arc<dyn ContainerEngine> {
    let engine = DockerEngine::connect(&EngineConfig::default())
        .await
        .expect("should connect to Docker daemon");
    Arc::new(engine)
}

/// Environment with logs kept quiet unless the env asks otherwise.
pub async fn environment(name: &str) -> TestEnvironment {
    init_tracing();
    let config = SweepConfig::from_env();
    let config = if std::env::var(claw_testnet::config::ENV_SHOW_CONTAINER_LOGS).is_ok() {
        config
    } else {
        config.with_log_policy(LogPolicy::Never)
    };
    TestEnvironment::setup(engine().await, &unique_test_id(name), config)
        .await
        .expect("should set up test environment")
}

/// A node serving `/health` from its volume with busybox httpd.
pub fn http_node(node_type: NodeType) -> NodeConfig {
    let script = format!(
        "mkdir -p /home/node/www && echo ok > /home/node/www/health && \
         exec httpd -f -p {HTTP_PORT} -h /home/node/www"
    );
    NodeConfig::new(node_type, NODE_IMAGE)
        .with_entrypoint(["sh", "-c"])
        .with_cmd([script])
        .with_ports(PortTable::new().with("http", HTTP_PORT))
        .with_readiness(HttpHealthProbe::new("http", "/health"))
        .with_gate(
            ReadinessGate::immediate()
                .with_interval(Duration::from_millis(500))
                .with_timeout(Duration::from_secs(30)),
        )
        .with_stop_timeout(Duration::from_secs(2))
}

/// GET a path on a host address.
pub async fn http_get(addr: &str, path: &str) -> reqwest::Result<String> {
    reqwest::Client::new()
        .get(format!("http://{addr}{path}"))
        .timeout(Duration::from_secs(5))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}
