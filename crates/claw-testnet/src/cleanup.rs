//! Label-driven teardown of everything a test run created.
//!
//! The sweeper never fails: every engine error is logged and recorded in the
//! [`SweepReport`], and the sweep moves on to the next resource.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::config::{SweepConfig, TestOutcome};
use crate::engine::{ContainerEngine, ContainerSummary};
use crate::error::TestnetResult;
use crate::labels::{HELPER_ROLE, ROLE_LABEL, cleanup_filter, sanitize_name};

/// Extra time granted to a container stop beyond its graceful timeout.
const STOP_SLACK: Duration = Duration::from_secs(5);

/// Teardown callback handed to test harnesses.
pub type CleanupCallback = Box<dyn FnOnce(TestOutcome) -> BoxFuture<'static, SweepReport> + Send>;

/// What a sweep removed and what it could not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Teardown was skipped because containers are kept.
    pub skipped: bool,
    /// Names of removed containers.
    pub containers: Vec<String>,
    /// Names of removed volumes.
    pub volumes: Vec<String>,
    /// Names of removed networks.
    pub networks: Vec<String>,
    /// Log files written.
    pub log_files: Vec<PathBuf>,
    /// Swallowed errors.
    pub errors: Vec<String>,
}

impl SweepReport {
    /// Whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn record_error(&mut self, step: &str, err: impl std::fmt::Display) {
        warn!(step, error = %err, "cleanup step failed");
        self.errors.push(format!("{step}: {err}"));
    }
}

/// Removes every container, volume and network carrying a run's cleanup label.
#[derive(Clone)]
pub struct CleanupSweeper {
    engine: Arc<dyn ContainerEngine>,
    config: SweepConfig,
}

impl std::fmt::Debug for CleanupSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupSweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CleanupSweeper {
    /// Sweeper with an explicit configuration.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SweepConfig) -> Self {
        Self { engine, config }
    }

    /// Sweep configuration.
    #[must_use]
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Teardown callback for one test run.
    #[must_use]
    pub fn cleanup(&self, test_id: &str) -> CleanupCallback {
        let sweeper = self.clone();
        let test_id = test_id.to_string();
        Box::new(move |outcome| -> BoxFuture<'static, SweepReport> {
            Box::pin(async move { sweeper.sweep(&test_id, outcome).await })
        })
    }

    /// Remove leftovers of an interrupted earlier run with the same identity.
    ///
    /// Ignores retention and log settings: nothing of an orphaned run is kept.
    pub async fn sweep_orphans(&self, test_id: &str) -> SweepReport {
        let filter = cleanup_filter(test_id);
        let mut report = SweepReport::default();

        self.remove_containers(&filter, None, &mut report).await;
        self.remove_volumes(&filter, &mut report).await;
        self.remove_networks(&filter, &mut report).await;

        if !report.containers.is_empty() || !report.networks.is_empty() {
            info!(
                test_id = %test_id,
                containers = report.containers.len(),
                volumes = report.volumes.len(),
                networks = report.networks.len(),
                "removed orphaned resources"
            );
        }
        report
    }

    /// Tear down everything labeled with `test_id`.
    pub async fn sweep(&self, test_id: &str, outcome: TestOutcome) -> SweepReport {
        let retention = self.config.retention;
        if retention.keep_containers {
            info!(test_id = %test_id, "keeping containers, skipping teardown");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        }

        let filter = cleanup_filter(test_id);
        let mut report = SweepReport::default();
        let dump = self
            .config
            .log_policy
            .lines_for(outcome, self.config.log_tail)
            .map(|tail| LogDump {
                test_id,
                outcome,
                tail,
            });

        self.remove_containers(&filter, dump.as_ref(), &mut report)
            .await;

        if retention.keeps_volumes_at_teardown(outcome) {
            info!(test_id = %test_id, "keeping volumes of failed run");
        } else {
            self.remove_volumes(&filter, &mut report).await;
        }
        self.remove_networks(&filter, &mut report).await;

        info!(
            test_id = %test_id,
            outcome = ?outcome,
            containers = report.containers.len(),
            volumes = report.volumes.len(),
            networks = report.networks.len(),
            errors = report.errors.len(),
            "teardown finished"
        );
        report
    }

    async fn remove_containers(
        &self,
        filter: &str,
        dump: Option<&LogDump<'_>>,
        report: &mut SweepReport,
    ) {
        let containers = match self.engine.list_containers(Some(filter), true).await {
            Ok(containers) => containers,
            Err(e) => {
                report.record_error("list containers", e);
                return;
            }
        };

        let teardowns: Vec<ContainerTeardown> = stream::iter(containers)
            .map(|container| self.teardown_container(container, dump))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for teardown in teardowns {
            report.log_files.extend(teardown.log_file);
            for e in teardown.errors {
                report.record_error(&format!("container {}", teardown.name), e);
            }
            if teardown.removed {
                report.containers.push(teardown.name);
            }
        }
        report.containers.sort();
    }

    async fn teardown_container(
        &self,
        container: ContainerSummary,
        dump: Option<&LogDump<'_>>,
    ) -> ContainerTeardown {
        let mut teardown = ContainerTeardown {
            name: container.name.clone(),
            ..ContainerTeardown::default()
        };
        let is_helper = container
            .labels
            .get(ROLE_LABEL)
            .is_some_and(|role| role == HELPER_ROLE);

        if let Some(dump) = dump.filter(|_| !is_helper) {
            match self.dump_logs(&container, dump).await {
                Ok(path) => teardown.log_file = path,
                Err(e) => teardown.errors.push(format!("dump logs: {e}")),
            }
        }

        if container.state.is_running() {
            let secs = i64::try_from(self.config.stop_timeout.as_secs()).unwrap_or(i64::MAX);
            let stop = tokio::time::timeout(
                self.config.stop_timeout + STOP_SLACK,
                self.engine.stop_container(&container.id, secs),
            )
            .await;
            match stop {
                Ok(Ok(())) => debug!(container = %container.name, "stopped"),
                Ok(Err(e)) if e.is_not_found() => {}
                // force removal below kills it anyway
                Ok(Err(e)) => warn!(container = %container.name, error = %e, "stop failed"),
                Err(_) => warn!(container = %container.name, "stop timed out"),
            }
        }

        match self.engine.remove_container(&container.id, true).await {
            Ok(()) => teardown.removed = true,
            Err(e) if e.is_not_found() => {}
            Err(e) => teardown.errors.push(format!("remove: {e}")),
        }
        teardown
    }

    async fn dump_logs(
        &self,
        container: &ContainerSummary,
        dump: &LogDump<'_>,
    ) -> TestnetResult<Option<PathBuf>> {
        let raw = self.engine.logs(&container.id, dump.tail).await?;
        let text = String::from_utf8_lossy(&raw);

        let Some(ref dir) = self.config.log_dir else {
            info!(container = %container.name, "container logs:\n{text}");
            return Ok(None);
        };

        let path = log_path(dir, dump.test_id, &container.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let header = format!(
            "# {} ({:?}) captured {}\n",
            container.name,
            dump.outcome,
            chrono::Utc::now().to_rfc3339()
        );
        tokio::fs::write(&path, [header.as_bytes(), raw.as_slice()].concat()).await?;
        info!(container = %container.name, path = %path.display(), "container logs written");
        Ok(Some(path))
    }

    async fn remove_volumes(&self, filter: &str, report: &mut SweepReport) {
        match self
            .retry_prune("prune volumes", || self.engine.prune_volumes(filter))
            .await
        {
            Ok(pruned) => report.volumes.extend(pruned),
            Err(e) => report.record_error("prune volumes", e),
        }

        // prune skips volumes some engines consider anonymous; remove the rest by name
        let remaining = match self.engine.list_volumes(filter).await {
            Ok(volumes) => volumes,
            Err(e) => {
                report.record_error("list volumes", e);
                return;
            }
        };
        for volume in remaining {
            match self.engine.remove_volume(&volume.name, true).await {
                Ok(()) => report.volumes.push(volume.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => report.record_error(&format!("remove volume {}", volume.name), e),
            }
        }
        report.volumes.sort();
    }

    async fn remove_networks(&self, filter: &str, report: &mut SweepReport) {
        match self
            .retry_prune("prune networks", || self.engine.prune_networks(filter))
            .await
        {
            Ok(pruned) => report.networks.extend(pruned),
            Err(e) => report.record_error("prune networks", e),
        }

        let remaining = match self.engine.list_networks(Some(filter)).await {
            Ok(networks) => networks,
            Err(e) => {
                report.record_error("list networks", e);
                return;
            }
        };
        for network in remaining {
            match self.engine.remove_network(&network.id).await {
                Ok(()) => report.networks.push(network.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => report.record_error(&format!("remove network {}", network.name), e),
            }
        }
        report.networks.sort();
    }

    async fn retry_prune<T, F, Fut>(&self, what: &str, mut op: F) -> TestnetResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TestnetResult<T>>,
    {
        let retry = self.config.prune_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_prune_in_progress() && attempt < retry.max_attempts => {
                    debug!(what, attempt, "prune already running, retrying");
                    tokio::time::sleep(retry.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct LogDump<'a> {
    test_id: &'a str,
    outcome: TestOutcome,
    tail: Option<usize>,
}

#[derive(Default)]
struct ContainerTeardown {
    name: String,
    removed: bool,
    log_file: Option<PathBuf>,
    errors: Vec<String>,
}

/// Where a container's logs are persisted: `<dir>/<test_id>/<container>.log`.
#[must_use]
pub fn log_path(dir: &Path, test_id: &str, container_name: &str) -> PathBuf {
    dir.join(sanitize_name(test_id))
        .join(format!("{container_name}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_util::sync::CancellationToken;

    use crate::config::{LogPolicy, PruneRetry, RetentionPolicy};
    use crate::engine::MemoryEngine;
    use crate::network::NetworkProvisioner;
    use crate::node::{NodeConfig, NodeType};
    use crate::nodeset::NodeSet;
    use crate::subnet::SubnetAllocator;

    const TEST_ID: &str = "sweep::case";

    async fn running_topology(engine: &Arc<MemoryEngine>, test_id: &str) -> NodeSet {
        let network = NetworkProvisioner::new(engine.clone())
            .with_allocator(SubnetAllocator::parse("10.90.0.0/16").expect("base"))
            .create_network(test_id)
            .await
            .expect("should create network");
        let set = NodeSet::new(engine.clone(), network);
        for _ in 0..2 {
            set.add_node(NodeConfig::new(NodeType::Validator, "ghcr.io/example/app:v1"))
                .await
                .expect("should add node");
        }
        set.start_all(&CancellationToken::new())
            .await
            .expect("should start");
        set
    }

    fn quiet() -> SweepConfig {
        SweepConfig::default()
            .with_log_policy(LogPolicy::Never)
            .with_prune_retry(PruneRetry {
                max_attempts: 5,
                backoff: Duration::from_millis(10),
            })
    }

    #[test]
    fn test_log_path_layout() {
        let path = log_path(Path::new("/tmp/logs"), "suite::case", "val-0-suite-case");
        assert_eq!(path, PathBuf::from("/tmp/logs/suite-case/val-0-suite-case.log"));
    }

    #[tokio::test]
    async fn test_sweep_removes_everything_labeled() {
        let engine = Arc::new(MemoryEngine::new());
        let _set = running_topology(&engine, TEST_ID).await;
        engine
            .add_foreign_network("bridge", "172.17.0.0/16")
            .expect("foreign");

        let report = CleanupSweeper::new(engine.clone(), quiet())
            .sweep(TEST_ID, TestOutcome::Passed)
            .await;

        assert!(report.is_clean(), "errors: {:?}", report.errors);
        assert_eq!(report.containers, vec!["val-0-sweep-case", "val-1-sweep-case"]);
        assert_eq!(report.volumes.len(), 2);
        assert_eq!(report.networks.len(), 1);
        assert!(engine.container_names().is_empty());
        assert!(engine.volume_names().is_empty());
        assert_eq!(engine.network_names(), vec!["bridge"]);
    }

    #[tokio::test]
    async fn test_sweep_leaves_other_runs_alone() {
        let engine = Arc::new(MemoryEngine::new());
        let _mine = running_topology(&engine, TEST_ID).await;
        let _theirs = running_topology(&engine, "other").await;

        CleanupSweeper::new(engine.clone(), quiet())
            .sweep(TEST_ID, TestOutcome::Passed)
            .await;

        assert_eq!(
            engine.container_names(),
            vec!["val-0-other", "val-1-other"]
        );
    }

    #[tokio::test]
    async fn test_prune_conflict_is_retried() {
        let engine = Arc::new(MemoryEngine::new());
        let _set = running_topology(&engine, TEST_ID).await;
        engine.fail_prunes_with_conflict(3);

        let report = CleanupSweeper::new(engine.clone(), quiet())
            .sweep(TEST_ID, TestOutcome::Passed)
            .await;

        assert!(report.is_clean(), "errors: {:?}", report.errors);
        // three conflicts, then one volume prune and one network prune
        assert_eq!(engine.prune_calls(), 5);
        assert!(engine.volume_names().is_empty());
    }

    #[tokio::test]
    async fn test_prune_gives_up_after_max_attempts() {
        let engine = Arc::new(MemoryEngine::new());
        let _set = running_topology(&engine, TEST_ID).await;
        engine.fail_prunes_with_conflict(100);

        let report = CleanupSweeper::new(engine.clone(), quiet())
            .sweep(TEST_ID, TestOutcome::Passed)
            .await;

        assert!(!report.is_clean());
        assert!(report.errors.iter().any(|e| e.starts_with("prune volumes")));
        // individual removal still cleans up
        assert!(engine.volume_names().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_keeps_volumes_when_asked() {
        let engine = Arc::new(MemoryEngine::new());
        let _set = running_topology(&engine, TEST_ID).await;
        let config =
            quiet().with_retention(RetentionPolicy::default().with_keep_volumes_on_failure(true));
        let sweeper = CleanupSweeper::new(engine.clone(), config);

        let report = sweeper.sweep(TEST_ID, TestOutcome::Failed).await;

        assert!(report.volumes.is_empty());
        assert!(engine.container_names().is_empty());
        assert_eq!(engine.volume_names().len(), 2);
        assert!(engine.network_names().is_empty());
    }

    #[tokio::test]
    async fn test_keep_containers_skips_teardown() {
        let engine = Arc::new(MemoryEngine::new());
        let _set = running_topology(&engine, TEST_ID).await;
        let config = quiet().with_retention(RetentionPolicy::default().with_keep_containers(true));

        let report = CleanupSweeper::new(engine.clone(), config)
            .sweep(TEST_ID, TestOutcome::Failed)
            .await;

        assert!(report.skipped);
        assert_eq!(engine.running_container_names().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_logs_are_written_in_full() {
        let engine = Arc::new(MemoryEngine::new());
        let _set = running_topology(&engine, TEST_ID).await;
        for i in 0..80 {
            engine
                .append_log("val-0-sweep-case", &format!("line {i}"))
                .expect("log");
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let config = quiet()
            .with_log_policy(LogPolicy::Auto)
            .with_log_dir(dir.path());

        let report = CleanupSweeper::new(engine.clone(), config)
            .sweep(TEST_ID, TestOutcome::Failed)
            .await;

        assert_eq!(report.log_files.len(), 2);
        let path = log_path(dir.path(), TEST_ID, "val-0-sweep-case");
        let text = std::fs::read_to_string(&path).expect("log file");
        assert!(text.starts_with("# val-0-sweep-case (Failed)"));
        assert!(text.contains("starting val-0-sweep-case"));
        assert!(text.contains("line 79"));
    }

    #[tokio::test]
    async fn test_passing_run_logs_only_tail() {
        let engine = Arc::new(MemoryEngine::new());
        let _set = running_topology(&engine, TEST_ID).await;
        for i in 0..80 {
            engine
                .append_log("val-0-sweep-case", &format!("line {i}"))
                .expect("log");
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let config = quiet()
            .with_log_policy(LogPolicy::Auto)
            .with_log_dir(dir.path());

        CleanupSweeper::new(engine.clone(), config)
            .sweep(TEST_ID, TestOutcome::Passed)
            .await;

        let path = log_path(dir.path(), TEST_ID, "val-0-sweep-case");
        let text = std::fs::read_to_string(&path).expect("log file");
        assert!(!text.contains("starting val-0-sweep-case"));
        assert!(!text.contains("line 29\n"));
        assert!(text.contains("line 30\n"));
        assert!(text.contains("line 79\n"));
    }

    #[tokio::test]
    async fn test_callback_runs_sweep() {
        let engine = Arc::new(MemoryEngine::new());
        let _set = running_topology(&engine, TEST_ID).await;
        let callback = CleanupSweeper::new(engine.clone(), quiet()).cleanup(TEST_ID);

        let report = tokio::spawn(callback(TestOutcome::Passed))
            .await
            .expect("callback task");
        assert_eq!(report.containers.len(), 2);
        assert!(engine.network_names().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_sweep_ignores_retention() {
        let engine = Arc::new(MemoryEngine::new());
        let set = running_topology(&engine, TEST_ID).await;
        drop(set);
        let config = quiet().with_retention(RetentionPolicy::default().with_keep_containers(true));

        let report = CleanupSweeper::new(engine.clone(), config)
            .sweep_orphans(TEST_ID)
            .await;

        assert!(!report.skipped);
        assert!(engine.container_names().is_empty());
        assert!(engine.volume_names().is_empty());
        assert!(engine.network_names().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_to_do_is_clean() {
        let engine = Arc::new(MemoryEngine::new());
        let report = CleanupSweeper::new(engine.clone(), quiet())
            .sweep("never-ran", TestOutcome::Passed)
            .await;
        assert!(report.is_clean());
        assert_eq!(report, SweepReport::default());
    }
}
