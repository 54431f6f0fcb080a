//! Error types for claw-testnet.

use std::fmt;
use std::time::Duration;

use ipnet::Ipv4Net;
use thiserror::Error;

/// Kind of engine resource an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A container.
    Container,
    /// A named volume.
    Volume,
    /// A network.
    Network,
    /// An image.
    Image,
    /// An exec instance.
    Exec,
    /// A file inside a volume.
    File,
}

impl ResourceKind {
    /// Get kind name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Volume => "volume",
            Self::Network => "network",
            Self::Image => "image",
            Self::Exec => "exec",
            Self::File => "file",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Errors produced while provisioning, driving, or tearing down a topology.
#[derive(Debug, Error)]
pub enum TestnetError {
    /// Failed to connect to the container engine.
    #[error("failed to connect to container engine: {0}")]
    ConnectionFailed(String),

    /// An engine resource does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource name or ID.
        name: String,
    },

    /// The engine rejected a request because of a conflicting state.
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource name or ID.
        name: String,
        /// Engine message.
        message: String,
    },

    /// Any other engine failure.
    #[error("container engine failed to {operation}: {message}")]
    Engine {
        /// Operation that failed (e.g. "create container").
        operation: &'static str,
        /// HTTP status code, when the engine returned one.
        status: Option<u16>,
        /// Engine message.
        message: String,
    },

    /// One or more node names are not registered in the node set.
    #[error("nodes not found: {}", names.join(", "))]
    NodesNotFound {
        /// Missing node names.
        names: Vec<String>,
    },

    /// A node with the same name is already registered.
    #[error("node already exists: {name}")]
    NodeExists {
        /// Node name.
        name: String,
    },

    /// An operation needed a container but none has been created for the node.
    #[error("no container recorded for node {node}; create the container first")]
    NoContainer {
        /// Node name.
        node: String,
    },

    /// An operation needed a running container.
    #[error("container for node {node} is not running (state: {state})")]
    NotRunning {
        /// Node name.
        node: String,
        /// Observed state.
        state: String,
    },

    /// A command exited with a non-zero code.
    #[error(
        "command {cmd:?} on {target} exited with code {exit_code}\nstdout: {stdout}\nstderr: {stderr}"
    )]
    ExecFailed {
        /// Node or helper container the command ran in.
        target: String,
        /// Command line.
        cmd: Vec<String>,
        /// Exit code.
        exit_code: i64,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },

    /// A readiness gate ran out of time.
    #[error("{target} did not become ready within {timeout:?} (last error: {last_error})")]
    ReadinessTimeout {
        /// What was being waited on.
        target: String,
        /// Configured timeout.
        timeout: Duration,
        /// Last transient error observed by the check, or "none".
        last_error: String,
    },

    /// A stop did not complete in time.
    #[error("{target} did not stop within {timeout:?}")]
    StopTimeout {
        /// Node name.
        target: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The container port has no published host binding.
    #[error("port {port} is not bound to a host port on {container}")]
    PortNotBound {
        /// Container name.
        container: String,
        /// Container-side port spec.
        port: String,
    },

    /// A port name was not declared in the node's port table.
    #[error("unknown port name: {0}")]
    UnknownPort(String),

    /// A readiness probe could not talk to the node.
    #[error("probe {probe} failed: {reason}")]
    ProbeFailed {
        /// Probe description.
        probe: String,
        /// Failure reason.
        reason: String,
    },

    /// No free subnet was found within the retry bound.
    #[error("no free /24 subnet after trying {attempts} base ranges starting at {start}")]
    SubnetExhausted {
        /// First base range tried.
        start: Ipv4Net,
        /// Number of base ranges tried.
        attempts: usize,
    },

    /// A CIDR string could not be parsed.
    #[error("invalid CIDR {cidr}: {reason}")]
    InvalidCidr {
        /// Offending input.
        cidr: String,
        /// Parse failure.
        reason: String,
    },

    /// Isolated network provisioning failed; the run cannot proceed.
    #[error("network setup failed for test {test_id}: {source}")]
    NetworkSetup {
        /// Test identity.
        test_id: String,
        /// Underlying failure.
        #[source]
        source: Box<TestnetError>,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Archive (tar) encoding or decoding failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TestnetError {
    /// Whether the error means the resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the engine reported a conflicting state.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether a prune failed because another prune is already running.
    #[must_use]
    pub fn is_prune_in_progress(&self) -> bool {
        match self {
            Self::Conflict { message, .. } => {
                let message = message.to_ascii_lowercase();
                message.contains("already running") || message.contains("in progress")
            }
            _ => false,
        }
    }

    /// Whether the error leaves the run without an isolated network.
    #[must_use]
    pub fn is_setup_fatal(&self) -> bool {
        matches!(
            self,
            Self::NetworkSetup { .. } | Self::SubnetExhausted { .. } | Self::InvalidCidr { .. }
        )
    }

    /// Whether the caller cancelled the operation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Whether a readiness gate timed out.
    #[must_use]
    pub fn is_readiness_timeout(&self) -> bool {
        matches!(self, Self::ReadinessTimeout { .. })
    }
}

/// Result type for testnet operations.
pub type TestnetResult<T> = std::result::Result<T, TestnetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = TestnetError::NotFound {
            kind: ResourceKind::Volume,
            name: "val-0-data".to_string(),
        };
        assert_eq!(err.to_string(), "volume not found: val-0-data");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_nodes_not_found_mentions_every_name() {
        let err = TestnetError::NodesNotFound {
            names: vec!["a".to_string(), "b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("a, b"));
    }

    #[test]
    fn test_prune_in_progress_classification() {
        let err = TestnetError::Conflict {
            kind: ResourceKind::Volume,
            name: "prune".to_string(),
            message: "a prune operation is already running".to_string(),
        };
        assert!(err.is_conflict());
        assert!(err.is_prune_in_progress());

        let other = TestnetError::Conflict {
            kind: ResourceKind::Container,
            name: "abc".to_string(),
            message: "container is running".to_string(),
        };
        assert!(!other.is_prune_in_progress());
    }

    #[test]
    fn test_setup_fatal_classification() {
        let err = TestnetError::NetworkSetup {
            test_id: "t".to_string(),
            source: Box::new(TestnetError::ConnectionFailed("refused".to_string())),
        };
        assert!(err.is_setup_fatal());
        assert!(!TestnetError::Cancelled("x".to_string()).is_setup_fatal());
    }

    #[test]
    fn test_exec_failed_carries_streams() {
        let err = TestnetError::ExecFailed {
            target: "val-0".to_string(),
            cmd: vec!["false".to_string()],
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exited with code 1"));
        assert!(msg.contains("out"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_timeout_and_cancel_are_distinct() {
        let timeout = TestnetError::ReadinessTimeout {
            target: "val-0".to_string(),
            timeout: Duration::from_secs(30),
            last_error: "none".to_string(),
        };
        let cancelled = TestnetError::Cancelled("readiness of val-0".to_string());
        assert!(timeout.is_readiness_timeout());
        assert!(!timeout.is_cancelled());
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_readiness_timeout());
    }
}
