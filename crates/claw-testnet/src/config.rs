//! Configuration for engine access, resource retention and teardown.
//!
//! Environment overrides are read once, by [`SweepConfig::from_env`], and then
//! travel as plain values. Nothing in the crate consults the process
//! environment after that.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable: keep volumes when the test failed.
pub const ENV_KEEP_VOLUMES_ON_FAILURE: &str = "CLAW_TESTNET_KEEP_VOLUMES_ON_FAILURE";
/// Environment variable: skip teardown entirely.
pub const ENV_KEEP_CONTAINERS: &str = "CLAW_TESTNET_KEEP_CONTAINERS";
/// Environment variable: `always` / `never` dump container logs.
pub const ENV_SHOW_CONTAINER_LOGS: &str = "CLAW_TESTNET_SHOW_CONTAINER_LOGS";
/// Environment variable: log lines kept for dumps of passing tests.
pub const ENV_CONTAINER_LOG_TAIL: &str = "CLAW_TESTNET_CONTAINER_LOG_TAIL";
/// Environment variable: directory for persisted container logs.
pub const ENV_LOG_DIR: &str = "CLAW_TESTNET_LOG_DIR";

/// Default number of log lines dumped for passing tests.
pub const DEFAULT_LOG_TAIL: usize = 50;

/// Outcome of the test a teardown runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestOutcome {
    /// The test passed.
    Passed,
    /// The test failed.
    Failed,
}

impl TestOutcome {
    /// Whether the test failed.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// When container logs are dumped at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPolicy {
    /// Full logs on failure, the last `log_tail` lines otherwise.
    #[default]
    Auto,
    /// Full logs regardless of outcome.
    Always,
    /// Never dump logs.
    Never,
}

impl LogPolicy {
    /// Parse the `CLAW_TESTNET_SHOW_CONTAINER_LOGS` value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Some(Self::Auto),
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            _ => None,
        }
    }

    /// How many lines to dump for a test outcome; `Some(None)` means all of them.
    #[must_use]
    pub fn lines_for(&self, outcome: TestOutcome, tail: usize) -> Option<Option<usize>> {
        match (self, outcome) {
            (Self::Never, _) => None,
            (Self::Always, _) | (Self::Auto, TestOutcome::Failed) => Some(None),
            (Self::Auto, TestOutcome::Passed) => Some(Some(tail)),
        }
    }
}

/// Single policy deciding which resources survive removal and teardown.
///
/// Per-call remove options are derived from it and the sweeper consults the
/// same value, so a per-call choice and the run-wide default never disagree
/// silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep a node's volume when the node is removed from its node set.
    pub keep_volumes_on_remove: bool,
    /// Keep all labeled volumes at teardown when the test failed.
    pub keep_volumes_on_failure: bool,
    /// Skip teardown entirely (containers, volumes and network stay).
    pub keep_containers: bool,
}

impl RetentionPolicy {
    /// Policy that keeps a node's volume across removal.
    #[must_use]
    pub fn preserve_volumes() -> Self {
        Self {
            keep_volumes_on_remove: true,
            ..Self::default()
        }
    }

    /// Keep volumes of failed runs for postmortem inspection.
    #[must_use]
    pub fn with_keep_volumes_on_failure(mut self, keep: bool) -> Self {
        self.keep_volumes_on_failure = keep;
        self
    }

    /// Skip teardown entirely.
    #[must_use]
    pub fn with_keep_containers(mut self, keep: bool) -> Self {
        self.keep_containers = keep;
        self
    }

    /// Whether teardown must leave volumes in place.
    #[must_use]
    pub fn keeps_volumes_at_teardown(&self, outcome: TestOutcome) -> bool {
        self.keep_containers || (self.keep_volumes_on_failure && outcome.is_failure())
    }
}

/// Retry settings for prune calls racing a concurrent prune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneRetry {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: Duration,
}

impl Default for PruneRetry {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Teardown configuration for [`crate::CleanupSweeper`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// What survives teardown.
    pub retention: RetentionPolicy,
    /// When to dump container logs.
    pub log_policy: LogPolicy,
    /// Lines dumped for passing tests under [`LogPolicy::Auto`].
    pub log_tail: usize,
    /// Directory receiving `<test_id>/<container>.log` files.
    pub log_dir: Option<PathBuf>,
    /// Graceful stop timeout before the engine kills a container.
    pub stop_timeout: Duration,
    /// Prune retry settings.
    pub prune_retry: PruneRetry,
    /// Containers processed concurrently.
    pub max_concurrency: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            log_policy: LogPolicy::Auto,
            log_tail: DEFAULT_LOG_TAIL,
            log_dir: None,
            stop_timeout: Duration::from_secs(10),
            prune_retry: PruneRetry::default(),
            max_concurrency: 8,
        }
    }
}

impl SweepConfig {
    /// Read overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup.
    ///
    /// Malformed values are logged and ignored; teardown configuration never
    /// fails a run.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_KEEP_VOLUMES_ON_FAILURE) {
            config.retention.keep_volumes_on_failure =
                parse_flag(ENV_KEEP_VOLUMES_ON_FAILURE, &value);
        }
        if let Some(value) = lookup(ENV_KEEP_CONTAINERS) {
            config.retention.keep_containers = parse_flag(ENV_KEEP_CONTAINERS, &value);
        }
        if let Some(value) = lookup(ENV_SHOW_CONTAINER_LOGS) {
            match LogPolicy::parse(&value) {
                Some(policy) => config.log_policy = policy,
                None => warn!(var = ENV_SHOW_CONTAINER_LOGS, value = %value, "ignoring unknown log policy"),
            }
        }
        if let Some(value) = lookup(ENV_CONTAINER_LOG_TAIL) {
            match value.trim().parse::<usize>() {
                Ok(tail) => config.log_tail = tail,
                Err(e) => warn!(var = ENV_CONTAINER_LOG_TAIL, value = %value, error = %e, "ignoring invalid log tail"),
            }
        }
        if let Some(value) = lookup(ENV_LOG_DIR) {
            let value = value.trim();
            if !value.is_empty() {
                config.log_dir = Some(PathBuf::from(value));
            }
        }

        config
    }

    /// Replace the retention policy.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Replace the log policy.
    #[must_use]
    pub fn with_log_policy(mut self, policy: LogPolicy) -> Self {
        self.log_policy = policy;
        self
    }

    /// Persist dumped logs under a directory.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Set the graceful stop timeout.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set prune retry settings.
    #[must_use]
    pub fn with_prune_retry(mut self, retry: PruneRetry) -> Self {
        self.prune_retry = retry;
        self
    }
}

fn parse_flag(var: &str, value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "" | "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(var, value, "ignoring unrecognized boolean, treating as false");
            false
        }
    }
}

/// How to reach the container engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineEndpoint {
    /// Local defaults (`DOCKER_HOST` or the platform socket).
    #[default]
    LocalDefaults,
    /// Explicit `tcp://` or `http://` URL.
    Http(String),
    /// Explicit Unix socket path.
    Unix(String),
}

/// Container engine connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where the engine listens.
    pub endpoint: EngineEndpoint,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// How long an exec may keep running after its output stream closes.
    pub exec_exit_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: EngineEndpoint::LocalDefaults,
            timeout_secs: 120,
            exec_exit_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Connect over HTTP to a remote engine.
    #[must_use]
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            endpoint: EngineEndpoint::Http(url.into()),
            ..Self::default()
        }
    }

    /// Connect to a Unix socket.
    #[must_use]
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            endpoint: EngineEndpoint::Unix(path.into()),
            ..Self::default()
        }
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the exec exit bound.
    #[must_use]
    pub fn with_exec_exit_timeout_secs(mut self, secs: u64) -> Self {
        self.exec_exit_timeout_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = SweepConfig::from_lookup(|_| None);
        assert_eq!(config, SweepConfig::default());
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.log_tail, DEFAULT_LOG_TAIL);
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = SweepConfig::from_lookup(lookup_from(&[
            (ENV_KEEP_VOLUMES_ON_FAILURE, "true"),
            (ENV_KEEP_CONTAINERS, "0"),
            (ENV_SHOW_CONTAINER_LOGS, "always"),
            (ENV_CONTAINER_LOG_TAIL, "200"),
            (ENV_LOG_DIR, "/tmp/claw-logs"),
        ]));

        assert!(config.retention.keep_volumes_on_failure);
        assert!(!config.retention.keep_containers);
        assert_eq!(config.log_policy, LogPolicy::Always);
        assert_eq!(config.log_tail, 200);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/claw-logs")));
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = SweepConfig::from_lookup(lookup_from(&[
            (ENV_SHOW_CONTAINER_LOGS, "sometimes"),
            (ENV_CONTAINER_LOG_TAIL, "many"),
            (ENV_KEEP_CONTAINERS, "maybe"),
        ]));

        assert_eq!(config.log_policy, LogPolicy::Auto);
        assert_eq!(config.log_tail, DEFAULT_LOG_TAIL);
        assert!(!config.retention.keep_containers);
    }

    #[test_case("always", Some(LogPolicy::Always) ; "always")]
    #[test_case("NEVER", Some(LogPolicy::Never) ; "case insensitive")]
    #[test_case("", Some(LogPolicy::Auto) ; "empty is auto")]
    #[test_case("loud", None ; "unknown")]
    fn test_log_policy_parse(value: &str, expected: Option<LogPolicy>) {
        assert_eq!(LogPolicy::parse(value), expected);
    }

    #[test]
    fn test_log_policy_lines() {
        assert_eq!(LogPolicy::Auto.lines_for(TestOutcome::Failed, 50), Some(None));
        assert_eq!(LogPolicy::Auto.lines_for(TestOutcome::Passed, 50), Some(Some(50)));
        assert_eq!(LogPolicy::Always.lines_for(TestOutcome::Passed, 50), Some(None));
        assert_eq!(LogPolicy::Never.lines_for(TestOutcome::Failed, 50), None);
    }

    #[test]
    fn test_retention_keeps_volumes_only_on_failure() {
        let policy = RetentionPolicy::default().with_keep_volumes_on_failure(true);
        assert!(policy.keeps_volumes_at_teardown(TestOutcome::Failed));
        assert!(!policy.keeps_volumes_at_teardown(TestOutcome::Passed));
    }

    #[test]
    fn test_keep_containers_keeps_everything() {
        let policy = RetentionPolicy::default().with_keep_containers(true);
        assert!(policy.keeps_volumes_at_teardown(TestOutcome::Passed));
    }

    #[test]
    fn test_engine_config_builders() {
        let config = EngineConfig::http("tcp://10.0.0.5:2375").with_timeout_secs(30);
        assert_eq!(
            config.endpoint,
            EngineEndpoint::Http("tcp://10.0.0.5:2375".to_string())
        );
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(EngineConfig::default().endpoint, EngineEndpoint::LocalDefaults);

        let config =
            EngineConfig::unix("/run/user/1000/docker.sock").with_exec_exit_timeout_secs(5);
        assert_eq!(
            config.endpoint,
            EngineEndpoint::Unix("/run/user/1000/docker.sock".to_string())
        );
        assert_eq!(config.exec_exit_timeout_secs, 5);
        assert_eq!(config.timeout_secs, 120);
    }
}
