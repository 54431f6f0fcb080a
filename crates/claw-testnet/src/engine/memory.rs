//! In-memory container engine for tests.
//!
//! Models the slice of engine behavior the topology layer depends on:
//! label filters, name conflicts, volumes that outlive containers, dynamic
//! host ports, "in use" protection on volumes and networks, and prune calls.
//! Failure injectors let tests exercise conflict retries and partial
//! failures without a daemon.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use parking_lot::Mutex;

use super::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerState, ContainerSummary,
    EngineFuture, ExecOutput, ExecRequest, HostBinding, MountType, NetworkRequest,
    NetworkSummary, PullPolicy, VolumeInfo,
};
use crate::archive;
use crate::error::{ResourceKind, TestnetError, TestnetResult};
use crate::labels::{HELPER_ROLE, ROLE_LABEL};

/// First host port handed out.
const FIRST_HOST_PORT: u16 = 32768;

/// Handler producing exec output for `(container name, request)`.
pub type ExecHandler = Arc<dyn Fn(&str, &ExecRequest) -> ExecOutput + Send + Sync>;

#[derive(Debug)]
struct MemContainer {
    id: String,
    spec: ContainerSpec,
    state: ContainerState,
    exit_code: Option<i64>,
    ports: HashMap<String, Vec<HostBinding>>,
    logs: Vec<u8>,
}

#[derive(Debug)]
struct MemVolume {
    info: VolumeInfo,
    /// Files keyed by path relative to the volume root.
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, MemContainer>,
    volumes: BTreeMap<String, MemVolume>,
    networks: BTreeMap<String, NetworkSummary>,
    images: HashSet<String>,
    pulls: Vec<String>,
    next_id: u64,
    next_port: u16,
    prune_conflicts: u32,
    prune_calls: u32,
    overlap_failures: u32,
    failing_starts: HashSet<String>,
    stop_delay: Duration,
    started_cmds: Vec<Vec<String>>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012x}", self.next_id)
    }

    fn next_port(&mut self) -> u16 {
        if self.next_port < FIRST_HOST_PORT {
            self.next_port = FIRST_HOST_PORT;
        }
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1);
        port
    }

    fn container_key(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .values()
            .find(|c| c.spec.name == id_or_name)
            .map(|c| c.id.clone())
    }

    fn container_mut(&mut self, id_or_name: &str) -> TestnetResult<&mut MemContainer> {
        let key = self
            .container_key(id_or_name)
            .ok_or_else(|| not_found(ResourceKind::Container, id_or_name))?;
        self.containers
            .get_mut(&key)
            .ok_or_else(|| not_found(ResourceKind::Container, id_or_name))
    }

    fn network_key(&self, id_or_name: &str) -> Option<String> {
        if self.networks.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.networks
            .values()
            .find(|n| n.name == id_or_name)
            .map(|n| n.id.clone())
    }

    fn volume_in_use(&self, name: &str) -> bool {
        self.containers.values().any(|c| {
            c.spec
                .mounts
                .iter()
                .any(|m| m.kind == MountType::Volume && m.source == name)
        })
    }

    fn network_in_use(&self, network: &NetworkSummary) -> bool {
        self.containers.values().any(|c| {
            c.spec
                .network
                .as_ref()
                .is_some_and(|a| a.network == network.id || a.network == network.name)
        })
    }

    fn take_prune_conflict(&mut self) -> TestnetResult<()> {
        self.prune_calls += 1;
        if self.prune_conflicts > 0 {
            self.prune_conflicts -= 1;
            return Err(TestnetError::Conflict {
                kind: ResourceKind::Volume,
                name: "prune".to_string(),
                message: "a prune operation is already running".to_string(),
            });
        }
        Ok(())
    }
}

/// The volume and relative path a container path lands in, if any.
fn resolve_path(container: &MemContainer, path: &str) -> Option<(String, String)> {
    let path = normalize(path);
    container
        .spec
        .mounts
        .iter()
        .filter(|m| m.kind == MountType::Volume)
        .filter(|m| {
            let target = normalize(&m.target);
            path == target || path.starts_with(&format!("{}/", target.trim_end_matches('/')))
        })
        .max_by_key(|m| m.target.len())
        .map(|mount| {
            let target = normalize(&mount.target);
            let rel = path[target.len()..].trim_start_matches('/').to_string();
            (mount.source.clone(), rel)
        })
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn join(dir: &str, file: &str) -> String {
    match (dir.is_empty(), file.is_empty()) {
        (true, _) => file.to_string(),
        (_, true) => dir.to_string(),
        _ => format!("{}/{}", dir.trim_end_matches('/'), file),
    }
}

fn not_found(kind: ResourceKind, name: &str) -> TestnetError {
    TestnetError::NotFound {
        kind,
        name: name.to_string(),
    }
}

fn matches_filter(labels: &HashMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// In-memory [`ContainerEngine`].
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
    exec_handler: Mutex<Option<ExecHandler>>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryEngine")
            .field("containers", &state.containers.len())
            .field("volumes", &state.volumes.len())
            .field("networks", &state.networks.len())
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unlabeled network occupying a subnet, as another tool would.
    ///
    /// # Errors
    ///
    /// Returns error if the subnet is not valid CIDR.
    pub fn add_foreign_network(&self, name: &str, subnet: &str) -> TestnetResult<()> {
        let subnet: Ipv4Net = subnet.parse().map_err(|e: ipnet::AddrParseError| {
            TestnetError::InvalidCidr {
                cidr: subnet.to_string(),
                reason: e.to_string(),
            }
        })?;
        let mut state = self.state.lock();
        let id = state.next_id("net");
        state.networks.insert(
            id.clone(),
            NetworkSummary {
                id,
                name: name.to_string(),
                subnets: vec![subnet.to_string()],
                labels: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Mark an image as present locally.
    pub fn add_image(&self, image: &str) {
        self.state.lock().images.insert(image.to_string());
    }

    /// Images pulled so far, in order.
    #[must_use]
    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().pulls.clone()
    }

    /// Commands of every container started so far, in order.
    #[must_use]
    pub fn started_commands(&self) -> Vec<Vec<String>> {
        self.state.lock().started_cmds.clone()
    }

    /// Make the next `n` prune calls fail as if another prune were running.
    pub fn fail_prunes_with_conflict(&self, n: u32) {
        self.state.lock().prune_conflicts = n;
    }

    /// Total prune calls received (volumes and networks).
    #[must_use]
    pub fn prune_calls(&self) -> u32 {
        self.state.lock().prune_calls
    }

    /// Make the next `n` network creations fail with a pool overlap.
    pub fn fail_network_creates_with_overlap(&self, n: u32) {
        self.state.lock().overlap_failures = n;
    }

    /// Make starting the named container fail.
    pub fn fail_start_of(&self, container_name: &str) {
        self.state
            .lock()
            .failing_starts
            .insert(container_name.to_string());
    }

    /// Delay every stop call by `delay`.
    pub fn set_stop_delay(&self, delay: Duration) {
        self.state.lock().stop_delay = delay;
    }

    /// Answer exec calls with a handler instead of an empty success.
    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &ExecRequest) -> ExecOutput + Send + Sync + 'static,
    {
        *self.exec_handler.lock() = Some(Arc::new(handler));
    }

    /// Simulate a crash: the container exits with `code`.
    ///
    /// # Errors
    ///
    /// Returns error if the container does not exist.
    pub fn kill(&self, container_name: &str, code: i64) -> TestnetResult<()> {
        let mut state = self.state.lock();
        let container = state.container_mut(container_name)?;
        container.state = ContainerState::Exited;
        container.exit_code = Some(code);
        container.ports.clear();
        Ok(())
    }

    /// Append to a container's log.
    ///
    /// # Errors
    ///
    /// Returns error if the container does not exist.
    pub fn append_log(&self, container_name: &str, line: &str) -> TestnetResult<()> {
        let mut state = self.state.lock();
        let container = state.container_mut(container_name)?;
        container.logs.extend_from_slice(line.as_bytes());
        container.logs.push(b'\n');
        Ok(())
    }

    /// Names of all containers, sorted.
    #[must_use]
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .containers
            .values()
            .map(|c| c.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Names of running containers, sorted.
    #[must_use]
    pub fn running_container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .containers
            .values()
            .filter(|c| c.state.is_running())
            .map(|c| c.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Labels of a container.
    #[must_use]
    pub fn container_labels(&self, container_name: &str) -> Option<HashMap<String, String>> {
        let state = self.state.lock();
        let key = state.container_key(container_name)?;
        state.containers.get(&key).map(|c| c.spec.labels.clone())
    }

    /// Names of all volumes, sorted.
    #[must_use]
    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().volumes.keys().cloned().collect()
    }

    /// Labels of a volume.
    #[must_use]
    pub fn volume_labels(&self, name: &str) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .volumes
            .get(name)
            .map(|v| v.info.labels.clone())
    }

    /// Contents of a file inside a volume.
    #[must_use]
    pub fn volume_file(&self, volume: &str, rel_path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .volumes
            .get(volume)
            .and_then(|v| v.files.get(rel_path.trim_start_matches('/')).cloned())
    }

    /// Names of all networks, sorted.
    #[must_use]
    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .networks
            .values()
            .map(|n| n.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Labels of a network.
    #[must_use]
    pub fn network_labels(&self, name: &str) -> Option<HashMap<String, String>> {
        let state = self.state.lock();
        let key = state.network_key(name)?;
        state.networks.get(&key).map(|n| n.labels.clone())
    }

    fn handle_exec(&self, container_name: &str, request: &ExecRequest) -> ExecOutput {
        let handler = self.exec_handler.lock().clone();
        match handler {
            Some(handler) => handler(container_name, request),
            None => ExecOutput::default(),
        }
    }
}

impl ContainerEngine for MemoryEngine {
    fn ping(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn ensure_image<'a>(&'a self, image: &'a str, policy: PullPolicy) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let present = state.images.contains(image);
            match policy {
                PullPolicy::Never if !present => Err(not_found(ResourceKind::Image, image)),
                PullPolicy::Never => Ok(()),
                PullPolicy::IfMissing if present => Ok(()),
                PullPolicy::IfMissing | PullPolicy::Always => {
                    state.pulls.push(image.to_string());
                    state.images.insert(image.to_string());
                    Ok(())
                }
            }
        })
    }

    fn create_network<'a>(&'a self, request: &'a NetworkRequest) -> EngineFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.lock();

            if state.overlap_failures > 0 {
                state.overlap_failures -= 1;
                return Err(TestnetError::Engine {
                    operation: "create network",
                    status: Some(403),
                    message: "Pool overlaps with other one on this address space".to_string(),
                });
            }
            if state.network_key(&request.name).is_some() {
                return Err(TestnetError::Conflict {
                    kind: ResourceKind::Network,
                    name: request.name.clone(),
                    message: format!("network with name {} already exists", request.name),
                });
            }
            let overlaps = state.networks.values().any(|n| {
                n.subnets
                    .iter()
                    .filter_map(|s| s.parse::<Ipv4Net>().ok())
                    .any(|s| s.contains(&request.subnet.network()) || request.subnet.contains(&s.network()))
            });
            if overlaps {
                return Err(TestnetError::Engine {
                    operation: "create network",
                    status: Some(403),
                    message: "Pool overlaps with other one on this address space".to_string(),
                });
            }

            let id = state.next_id("net");
            state.networks.insert(
                id.clone(),
                NetworkSummary {
                    id: id.clone(),
                    name: request.name.clone(),
                    subnets: vec![request.subnet.to_string()],
                    labels: request.labels.clone(),
                },
            );
            Ok(id)
        })
    }

    fn list_networks<'a>(
        &'a self,
        label_filter: Option<&'a str>,
    ) -> EngineFuture<'a, Vec<NetworkSummary>> {
        Box::pin(async move {
            let state = self.state.lock();
            Ok(state
                .networks
                .values()
                .filter(|n| label_filter.is_none_or(|f| matches_filter(&n.labels, f)))
                .cloned()
                .collect())
        })
    }

    fn remove_network<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let key = state
                .network_key(id)
                .ok_or_else(|| not_found(ResourceKind::Network, id))?;
            let in_use = state
                .networks
                .get(&key)
                .is_some_and(|n| state.network_in_use(n));
            if in_use {
                return Err(TestnetError::Conflict {
                    kind: ResourceKind::Network,
                    name: id.to_string(),
                    message: "network has active endpoints".to_string(),
                });
            }
            state.networks.remove(&key);
            Ok(())
        })
    }

    fn prune_networks<'a>(&'a self, label_filter: &'a str) -> EngineFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.take_prune_conflict()?;

            let doomed: Vec<(String, String)> = state
                .networks
                .values()
                .filter(|n| matches_filter(&n.labels, label_filter) && !state.network_in_use(n))
                .map(|n| (n.id.clone(), n.name.clone()))
                .collect();
            for (id, _) in &doomed {
                state.networks.remove(id);
            }
            Ok(doomed.into_iter().map(|(_, name)| name).collect())
        })
    }

    fn create_volume<'a>(
        &'a self,
        name: &'a str,
        labels: &'a HashMap<String, String>,
    ) -> EngineFuture<'a, VolumeInfo> {
        Box::pin(async move {
            let mut state = self.state.lock();
            // Creating an existing volume is a no-op that returns it unchanged
            let volume = state
                .volumes
                .entry(name.to_string())
                .or_insert_with(|| MemVolume {
                    info: VolumeInfo {
                        name: name.to_string(),
                        labels: labels.clone(),
                    },
                    files: BTreeMap::new(),
                });
            Ok(volume.info.clone())
        })
    }

    fn inspect_volume<'a>(&'a self, name: &'a str) -> EngineFuture<'a, VolumeInfo> {
        Box::pin(async move {
            self.state
                .lock()
                .volumes
                .get(name)
                .map(|v| v.info.clone())
                .ok_or_else(|| not_found(ResourceKind::Volume, name))
        })
    }

    fn list_volumes<'a>(&'a self, label_filter: &'a str) -> EngineFuture<'a, Vec<VolumeInfo>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .volumes
                .values()
                .filter(|v| matches_filter(&v.info.labels, label_filter))
                .map(|v| v.info.clone())
                .collect())
        })
    }

    fn remove_volume<'a>(&'a self, name: &'a str, _force: bool) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if !state.volumes.contains_key(name) {
                return Err(not_found(ResourceKind::Volume, name));
            }
            if state.volume_in_use(name) {
                return Err(TestnetError::Conflict {
                    kind: ResourceKind::Volume,
                    name: name.to_string(),
                    message: "volume is in use".to_string(),
                });
            }
            state.volumes.remove(name);
            Ok(())
        })
    }

    fn prune_volumes<'a>(&'a self, label_filter: &'a str) -> EngineFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.take_prune_conflict()?;

            let doomed: Vec<String> = state
                .volumes
                .values()
                .filter(|v| matches_filter(&v.info.labels, label_filter))
                .filter(|v| !state.volume_in_use(&v.info.name))
                .map(|v| v.info.name.clone())
                .collect();
            for name in &doomed {
                state.volumes.remove(name);
            }
            Ok(doomed)
        })
    }

    fn create_container<'a>(&'a self, spec: &'a ContainerSpec) -> EngineFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.lock();

            if state.container_key(&spec.name).is_some() {
                return Err(TestnetError::Conflict {
                    kind: ResourceKind::Container,
                    name: spec.name.clone(),
                    message: format!("container name {} is already in use", spec.name),
                });
            }
            if let Some(ref attachment) = spec.network {
                if state.network_key(&attachment.network).is_none() {
                    return Err(not_found(ResourceKind::Network, &attachment.network));
                }
            }
            // Unknown named volumes are created implicitly, without labels
            for mount in spec.mounts.iter().filter(|m| m.kind == MountType::Volume) {
                state
                    .volumes
                    .entry(mount.source.clone())
                    .or_insert_with(|| MemVolume {
                        info: VolumeInfo {
                            name: mount.source.clone(),
                            labels: HashMap::new(),
                        },
                        files: BTreeMap::new(),
                    });
            }

            let id = state.next_id("c");
            state.containers.insert(
                id.clone(),
                MemContainer {
                    id: id.clone(),
                    spec: spec.clone(),
                    state: ContainerState::Created,
                    exit_code: None,
                    ports: HashMap::new(),
                    logs: Vec::new(),
                },
            );
            Ok(id)
        })
    }

    fn start_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let key = state
                .container_key(id)
                .ok_or_else(|| not_found(ResourceKind::Container, id))?;

            let name = state
                .containers
                .get(&key)
                .map(|c| c.spec.name.clone())
                .unwrap_or_default();
            if state.failing_starts.contains(&name) {
                return Err(TestnetError::Engine {
                    operation: "start container",
                    status: Some(500),
                    message: format!("injected start failure for {name}"),
                });
            }
            let cmd = state
                .containers
                .get(&key)
                .and_then(|c| c.spec.cmd.clone())
                .unwrap_or_default();
            state.started_cmds.push(cmd);

            let port_specs: Vec<String> = state
                .containers
                .get(&key)
                .map(|c| c.spec.ports.clone())
                .unwrap_or_default();
            let mut ports = HashMap::new();
            for port_spec in port_specs {
                let host_port = state.next_port();
                ports.insert(
                    port_spec,
                    vec![HostBinding {
                        host_ip: "0.0.0.0".to_string(),
                        host_port: host_port.to_string(),
                    }],
                );
            }

            let container = state.container_mut(&key)?;
            if container.state.is_running() {
                return Ok(());
            }
            let is_helper = container
                .spec
                .labels
                .get(ROLE_LABEL)
                .is_some_and(|role| role == HELPER_ROLE);
            if is_helper {
                // Helpers run one short command and exit
                container.state = ContainerState::Exited;
                container.exit_code = Some(0);
            } else {
                container.state = ContainerState::Running;
                container.exit_code = None;
                container.ports = ports;
                let line = format!("starting {}\n", container.spec.name);
                container.logs.extend_from_slice(line.as_bytes());
            }
            Ok(())
        })
    }

    fn stop_container<'a>(&'a self, id: &'a str, _timeout_secs: i64) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let delay = {
                let state = self.state.lock();
                if state.container_key(id).is_none() {
                    return Err(not_found(ResourceKind::Container, id));
                }
                state.stop_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.state.lock();
            let container = state.container_mut(id)?;
            if container.state.is_running() {
                container.state = ContainerState::Exited;
                container.exit_code = Some(0);
                container.ports.clear();
                let line = format!("stopping {}\n", container.spec.name);
                container.logs.extend_from_slice(line.as_bytes());
            }
            Ok(())
        })
    }

    fn wait_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, i64> {
        Box::pin(async move {
            loop {
                {
                    let mut state = self.state.lock();
                    let container = state.container_mut(id)?;
                    if !container.state.is_running() {
                        return Ok(container.exit_code.unwrap_or(0));
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    }

    fn remove_container<'a>(&'a self, id: &'a str, force: bool) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let key = state
                .container_key(id)
                .ok_or_else(|| not_found(ResourceKind::Container, id))?;
            let running = state
                .containers
                .get(&key)
                .is_some_and(|c| c.state.is_running());
            if running && !force {
                return Err(TestnetError::Conflict {
                    kind: ResourceKind::Container,
                    name: id.to_string(),
                    message: "cannot remove a running container".to_string(),
                });
            }
            state.containers.remove(&key);
            Ok(())
        })
    }

    fn inspect_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ContainerDetails> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let container = state.container_mut(id)?;
            Ok(ContainerDetails {
                id: container.id.clone(),
                name: container.spec.name.clone(),
                state: container.state,
                exit_code: container.exit_code,
                labels: container.spec.labels.clone(),
                ports: container.ports.clone(),
            })
        })
    }

    fn list_containers<'a>(
        &'a self,
        label_filter: Option<&'a str>,
        all: bool,
    ) -> EngineFuture<'a, Vec<ContainerSummary>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .containers
                .values()
                .filter(|c| all || c.state.is_running())
                .filter(|c| label_filter.is_none_or(|f| matches_filter(&c.spec.labels, f)))
                .map(|c| ContainerSummary {
                    id: c.id.clone(),
                    name: c.spec.name.clone(),
                    state: c.state,
                    labels: c.spec.labels.clone(),
                })
                .collect())
        })
    }

    fn logs<'a>(&'a self, id: &'a str, tail: Option<usize>) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let container = state.container_mut(id)?;
            let text = String::from_utf8_lossy(&container.logs).to_string();
            let lines: Vec<&str> = text.lines().collect();
            let skip = tail.map_or(0, |n| lines.len().saturating_sub(n));
            let mut out = String::new();
            for line in &lines[skip..] {
                out.push_str(line);
                out.push('\n');
            }
            Ok(out.into_bytes())
        })
    }

    fn exec<'a>(&'a self, id: &'a str, request: &'a ExecRequest) -> EngineFuture<'a, ExecOutput> {
        Box::pin(async move {
            let name = {
                let mut state = self.state.lock();
                let container = state.container_mut(id)?;
                if !container.state.is_running() {
                    return Err(TestnetError::Conflict {
                        kind: ResourceKind::Container,
                        name: id.to_string(),
                        message: format!("container {id} is not running"),
                    });
                }
                container.spec.name.clone()
            };
            Ok(self.handle_exec(&name, request))
        })
    }

    fn upload_archive<'a>(
        &'a self,
        id: &'a str,
        dest_dir: &'a str,
        archive_bytes: Vec<u8>,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let files = archive::unpack_files(&archive_bytes)?;
            let mut state = self.state.lock();
            let (name, rel) = resolve_path(state.container_mut(id)?, dest_dir)
                .ok_or_else(|| not_found(ResourceKind::Volume, dest_dir))?;
            let volume = state
                .volumes
                .get_mut(&name)
                .ok_or_else(|| not_found(ResourceKind::Volume, &name))?;
            for file in files {
                volume.files.insert(join(&rel, &file.path), file.data);
            }
            Ok(())
        })
    }

    fn download_archive<'a>(&'a self, id: &'a str, path: &'a str) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let data = {
                let mut state = self.state.lock();
                resolve_path(state.container_mut(id)?, path).and_then(|(name, rel)| {
                    state
                        .volumes
                        .get(&name)
                        .and_then(|v| v.files.get(&rel).cloned())
                })
            };
            let data = data.ok_or_else(|| not_found(ResourceKind::File, path))?;
            archive::pack_file(basename(path), &data, 0o644)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Mount, NetworkAttachment};
    use crate::labels::cleanup_filter;

    fn labeled(test_id: &str) -> HashMap<String, String> {
        crate::labels::cleanup_labels(test_id)
    }

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "busybox".to_string(),
            labels: labeled("t"),
            ports: vec!["8080/tcp".to_string()],
            mounts: vec![Mount::volume(format!("{name}-data"), "/data")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ports_assigned_on_start_and_cleared_on_stop() {
        let engine = MemoryEngine::new();
        let id = engine.create_container(&spec("a")).await.expect("create");

        let created = engine.inspect_container(&id).await.expect("inspect");
        assert!(created.ports.is_empty());

        engine.start_container(&id).await.expect("start");
        let running = engine.inspect_container(&id).await.expect("inspect");
        assert_eq!(running.state, ContainerState::Running);
        assert_eq!(running.ports["8080/tcp"][0].host_port, "32768");

        engine.stop_container(&id, 1).await.expect("stop");
        let stopped = engine.inspect_container(&id).await.expect("inspect");
        assert!(stopped.ports.is_empty());
        assert_eq!(engine.wait_container(&id).await.expect("wait"), 0);
    }

    #[tokio::test]
    async fn test_pull_policies() {
        let engine = MemoryEngine::new();
        engine.add_image("busybox:1.36");

        engine
            .ensure_image("busybox:1.36", PullPolicy::Never)
            .await
            .expect("preloaded");
        engine
            .ensure_image("busybox:1.36", PullPolicy::IfMissing)
            .await
            .expect("present");
        assert!(engine.pulls().is_empty());

        engine
            .ensure_image("busybox:1.36", PullPolicy::Always)
            .await
            .expect("pulled");
        let err = engine
            .ensure_image("alpine:3", PullPolicy::Never)
            .await
            .expect_err("never pulled");
        assert!(err.is_not_found());
        assert_eq!(engine.pulls(), vec!["busybox:1.36".to_string()]);
    }

    #[tokio::test]
    async fn test_killed_container_exits_with_code() {
        let engine = MemoryEngine::new();
        let id = engine.create_container(&spec("a")).await.expect("create");
        engine.start_container(&id).await.expect("start");

        engine.kill("a", 137).expect("kill");
        let details = engine.inspect_container(&id).await.expect("inspect");
        assert_eq!(details.state, ContainerState::Exited);
        assert_eq!(details.exit_code, Some(137));
        assert!(details.ports.is_empty());
        assert!(engine.kill("missing", 1).is_err());
    }

    #[tokio::test]
    async fn test_volume_in_use_cannot_be_removed_or_pruned() {
        let engine = MemoryEngine::new();
        engine
            .create_volume("a-data", &labeled("t"))
            .await
            .expect("volume");
        let id = engine.create_container(&spec("a")).await.expect("create");

        let err = engine.remove_volume("a-data", true).await.expect_err("in use");
        assert!(err.is_conflict());
        assert!(engine.prune_volumes(&cleanup_filter("t")).await.expect("prune").is_empty());

        engine.remove_container(&id, true).await.expect("remove");
        let pruned = engine.prune_volumes(&cleanup_filter("t")).await.expect("prune");
        assert_eq!(pruned, vec!["a-data".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_prune_conflicts() {
        let engine = MemoryEngine::new();
        engine.fail_prunes_with_conflict(2);

        for _ in 0..2 {
            let err = engine.prune_volumes("x=y").await.expect_err("conflict");
            assert!(err.is_prune_in_progress());
        }
        engine.prune_volumes("x=y").await.expect("third prune succeeds");
        assert_eq!(engine.prune_calls(), 3);
    }

    #[tokio::test]
    async fn test_overlapping_network_rejected() {
        let engine = MemoryEngine::new();
        engine
            .add_foreign_network("other", "10.20.0.0/16")
            .expect("foreign network");

        let request = NetworkRequest {
            name: "mine".to_string(),
            subnet: "10.20.5.0/24".parse().expect("cidr"),
            labels: labeled("t"),
        };
        let err = engine.create_network(&request).await.expect_err("overlap");
        assert!(err.to_string().contains("overlaps"));
    }

    #[tokio::test]
    async fn test_archive_lands_in_volume() {
        let engine = MemoryEngine::new();
        let id = engine.create_container(&spec("a")).await.expect("create");

        let tar = archive::pack_file("genesis.json", b"{}", 0o644).expect("pack");
        engine
            .upload_archive(&id, "/data/config", tar)
            .await
            .expect("upload");

        assert_eq!(
            engine.volume_file("a-data", "config/genesis.json"),
            Some(b"{}".to_vec())
        );

        let downloaded = engine
            .download_archive(&id, "/data/config/genesis.json")
            .await
            .expect("download");
        assert_eq!(
            archive::unpack_single(&downloaded, "genesis").expect("unpack"),
            b"{}"
        );
    }

    #[tokio::test]
    async fn test_network_with_members_is_in_use() {
        let engine = MemoryEngine::new();
        let request = NetworkRequest {
            name: "net".to_string(),
            subnet: "10.1.1.0/24".parse().expect("cidr"),
            labels: labeled("t"),
        };
        let net_id = engine.create_network(&request).await.expect("network");

        let mut member = spec("a");
        member.network = Some(NetworkAttachment {
            network: net_id.clone(),
            aliases: vec![],
        });
        let id = engine.create_container(&member).await.expect("create");

        assert!(engine.remove_network(&net_id).await.expect_err("in use").is_conflict());
        engine.remove_container(&id, true).await.expect("remove");
        engine.remove_network("net").await.expect("remove by name");
    }

    #[tokio::test]
    async fn test_exec_requires_running_container() {
        let engine = MemoryEngine::new();
        engine.set_exec_handler(|name, req| ExecOutput {
            exit_code: 0,
            stdout: format!("{name}:{}", req.cmd.join(" ")).into_bytes(),
            stderr: Vec::new(),
        });
        let id = engine.create_container(&spec("a")).await.expect("create");

        let request = ExecRequest::cmd(vec!["echo".to_string(), "hi".to_string()]);
        assert!(engine.exec(&id, &request).await.expect_err("not running").is_conflict());

        engine.start_container(&id).await.expect("start");
        let output = engine.exec(&id, &request).await.expect("exec");
        assert_eq!(output.stdout_str(), "a:echo hi");
    }
}
