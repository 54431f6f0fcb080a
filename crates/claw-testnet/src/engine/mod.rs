//! Container engine abstraction.
//!
//! [`ContainerEngine`] is the only seam between the topology layer and the
//! daemon. Every call is one request/response round-trip; callers cancel by
//! dropping the returned future.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ NodeSet / NodeHandle / CleanupSweeper        │
//! └──────────────────────┬───────────────────────┘
//!                        │ Arc<dyn ContainerEngine>
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//!   DockerEngine (bollard)     MemoryEngine (test-util)
//! ```

pub mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::TestnetResult;

pub use docker::DockerEngine;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryEngine;

/// Boxed future returned by engine calls.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = TestnetResult<T>> + Send + 'a>>;

/// Container lifecycle state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContainerState {
    /// Created but never started.
    Created,
    /// Running.
    Running,
    /// Paused.
    Paused,
    /// Restarting.
    Restarting,
    /// Exited (stopped).
    Exited,
    /// Being removed.
    Removing,
    /// Dead.
    Dead,
    /// Unknown.
    #[default]
    Unknown,
}

impl ContainerState {
    /// Parse the engine's status string.
    #[must_use]
    pub fn from_status(status: &str) -> Self {
        match status {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "removing" => Self::Removing,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    /// Check if container is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Get state name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Removing => "removing",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Image pull behavior before container creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PullPolicy {
    /// Pull only when the image is not present locally.
    #[default]
    IfMissing,
    /// Always pull.
    Always,
    /// Never pull; fail when missing.
    Never,
}

/// Type of a container mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountType {
    /// Named engine volume.
    Volume,
    /// Host path bind.
    Bind,
}

/// A mount into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Volume name or host path.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    /// Mount type.
    pub kind: MountType,
    /// Read-only mount.
    pub read_only: bool,
}

impl Mount {
    /// Mount a named volume.
    #[must_use]
    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: name.into(),
            target: target.into(),
            kind: MountType::Volume,
            read_only: false,
        }
    }

    /// Bind a host path.
    #[must_use]
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: MountType::Bind,
            read_only: false,
        }
    }

    /// Mount read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Attachment of a container to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network ID or name.
    pub network: String,
    /// DNS aliases on that network.
    pub aliases: Vec<String>,
}

/// Everything the engine needs to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Hostname inside the container.
    pub hostname: Option<String>,
    /// Command override.
    pub cmd: Option<Vec<String>>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Environment (`KEY=VALUE`).
    pub env: Vec<String>,
    /// User (`uid:gid`).
    pub user: Option<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Labels, applied atomically at creation.
    pub labels: HashMap<String, String>,
    /// Container-side ports (`26657/tcp`) published on engine-chosen host ports.
    pub ports: Vec<String>,
    /// Mounts.
    pub mounts: Vec<Mount>,
    /// Network attachment.
    pub network: Option<NetworkAttachment>,
}

/// A published host binding for a container port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostBinding {
    /// Host IP (may be `0.0.0.0` or `::`).
    pub host_ip: String,
    /// Host port.
    pub host_port: String,
}

/// Result of a container inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDetails {
    /// Engine ID.
    pub id: String,
    /// Name without leading `/`.
    pub name: String,
    /// Current state.
    pub state: ContainerState,
    /// Exit code, once exited.
    pub exit_code: Option<i64>,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Port spec (`26657/tcp`) → host bindings.
    pub ports: HashMap<String, Vec<HostBinding>>,
}

/// Entry of a container list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Engine ID.
    pub id: String,
    /// Name without leading `/`.
    pub name: String,
    /// Current state.
    pub state: ContainerState,
    /// Labels.
    pub labels: HashMap<String, String>,
}

/// A named volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Labels.
    pub labels: HashMap<String, String>,
}

/// Request to create a bridge network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Network name.
    pub name: String,
    /// IPv4 subnet.
    pub subnet: Ipv4Net,
    /// Labels.
    pub labels: HashMap<String, String>,
}

/// Entry of a network list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    /// Engine ID.
    pub id: String,
    /// Name.
    pub name: String,
    /// IPAM subnets as reported by the engine (may include IPv6).
    pub subnets: Vec<String>,
    /// Labels.
    pub labels: HashMap<String, String>,
}

/// Command to execute in a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Command line.
    pub cmd: Vec<String>,
    /// Environment (`KEY=VALUE`).
    pub env: Vec<String>,
    /// User.
    pub user: Option<String>,
    /// Working directory.
    pub working_dir: Option<String>,
}

impl ExecRequest {
    /// Create a request for a command.
    #[must_use]
    pub fn cmd(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            ..Self::default()
        }
    }

    /// Set environment variables.
    #[must_use]
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Set working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Demultiplexed exec output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code.
    pub exit_code: i64,
    /// Stdout bytes.
    pub stdout: Vec<u8>,
    /// Stderr bytes.
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Check if command succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get stdout as string.
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as string.
    #[must_use]
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Container engine operations used by the topology layer.
///
/// Label filters are `key=value` strings as produced by
/// [`crate::labels::cleanup_filter`].
pub trait ContainerEngine: Send + Sync {
    /// Check that the engine is reachable.
    fn ping(&self) -> EngineFuture<'_, ()>;

    /// Make sure an image is present according to the pull policy.
    fn ensure_image<'a>(&'a self, image: &'a str, policy: PullPolicy) -> EngineFuture<'a, ()>;

    /// Create a bridge network and return its ID.
    fn create_network<'a>(&'a self, request: &'a NetworkRequest) -> EngineFuture<'a, String>;

    /// List networks, optionally filtered by label.
    fn list_networks<'a>(
        &'a self,
        label_filter: Option<&'a str>,
    ) -> EngineFuture<'a, Vec<NetworkSummary>>;

    /// Remove a network.
    fn remove_network<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()>;

    /// Prune unused networks matching a label filter; returns removed names.
    fn prune_networks<'a>(&'a self, label_filter: &'a str) -> EngineFuture<'a, Vec<String>>;

    /// Create a named volume.
    fn create_volume<'a>(
        &'a self,
        name: &'a str,
        labels: &'a HashMap<String, String>,
    ) -> EngineFuture<'a, VolumeInfo>;

    /// Inspect a named volume.
    fn inspect_volume<'a>(&'a self, name: &'a str) -> EngineFuture<'a, VolumeInfo>;

    /// List volumes matching a label filter.
    fn list_volumes<'a>(&'a self, label_filter: &'a str) -> EngineFuture<'a, Vec<VolumeInfo>>;

    /// Remove a named volume.
    fn remove_volume<'a>(&'a self, name: &'a str, force: bool) -> EngineFuture<'a, ()>;

    /// Prune unused volumes matching a label filter; returns removed names.
    fn prune_volumes<'a>(&'a self, label_filter: &'a str) -> EngineFuture<'a, Vec<String>>;

    /// Create (but do not start) a container; returns its ID.
    fn create_container<'a>(&'a self, spec: &'a ContainerSpec) -> EngineFuture<'a, String>;

    /// Start a container.
    fn start_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()>;

    /// Ask a container to stop, killing it after `timeout_secs`.
    fn stop_container<'a>(&'a self, id: &'a str, timeout_secs: i64) -> EngineFuture<'a, ()>;

    /// Wait until a container is not running; returns its exit code.
    fn wait_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, i64>;

    /// Remove a container.
    fn remove_container<'a>(&'a self, id: &'a str, force: bool) -> EngineFuture<'a, ()>;

    /// Inspect a container.
    fn inspect_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ContainerDetails>;

    /// List containers matching a label filter; `all` includes stopped ones.
    fn list_containers<'a>(
        &'a self,
        label_filter: Option<&'a str>,
        all: bool,
    ) -> EngineFuture<'a, Vec<ContainerSummary>>;

    /// Fetch combined logs, optionally only the last `tail` lines.
    fn logs<'a>(&'a self, id: &'a str, tail: Option<usize>) -> EngineFuture<'a, Vec<u8>>;

    /// Run a command in a running container and wait for it.
    fn exec<'a>(&'a self, id: &'a str, request: &'a ExecRequest) -> EngineFuture<'a, ExecOutput>;

    /// Extract a tar archive into `dest_dir` inside a container's filesystem.
    fn upload_archive<'a>(
        &'a self,
        id: &'a str,
        dest_dir: &'a str,
        archive: Vec<u8>,
    ) -> EngineFuture<'a, ()>;

    /// Fetch `path` from a container's filesystem as a tar archive.
    fn download_archive<'a>(&'a self, id: &'a str, path: &'a str) -> EngineFuture<'a, Vec<u8>>;
}
