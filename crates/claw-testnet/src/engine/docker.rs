//! Docker engine implementation using bollard.

use std::collections::HashMap;
use std::time::Duration;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, NetworkingConfig, RemoveContainerOptions,
    StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerState as BollardState, ContainerStateStatusEnum, EndpointSettings, ExecInspectResponse,
    HostConfig, Ipam, IpamConfig, Mount as BollardMount, MountTypeEnum, PortBinding, PortMap,
};
use bollard::network::{
    CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions, PruneNetworksOptions,
};
use bollard::volume::{
    CreateVolumeOptions, ListVolumesOptions, PruneVolumesOptions, RemoveVolumeOptions,
};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use super::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerState, ContainerSummary,
    EngineFuture, ExecOutput, ExecRequest, HostBinding, Mount, MountType, NetworkRequest,
    NetworkSummary, PullPolicy, VolumeInfo,
};
use crate::config::{EngineConfig, EngineEndpoint};
use crate::error::{ResourceKind, TestnetError, TestnetResult};

/// Docker engine backed by a bollard client.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    client: Docker,
    exec_exit_timeout: Duration,
}

/// Interval between exec exit-code polls.
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl DockerEngine {
    /// Connect to the Docker daemon and negotiate the API version.
    ///
    /// # Errors
    ///
    /// Returns error if connection or version negotiation fails.
    pub async fn connect(config: &EngineConfig) -> TestnetResult<Self> {
        let client = match &config.endpoint {
            EngineEndpoint::LocalDefaults => Docker::connect_with_local_defaults(),
            EngineEndpoint::Http(url) => {
                Docker::connect_with_http(url, config.timeout_secs, bollard::API_DEFAULT_VERSION)
            }
            #[cfg(unix)]
            EngineEndpoint::Unix(path) => {
                Docker::connect_with_unix(path, config.timeout_secs, bollard::API_DEFAULT_VERSION)
            }
            #[cfg(not(unix))]
            EngineEndpoint::Unix(path) => {
                return Err(TestnetError::InvalidConfig(format!(
                    "unix socket {path} is not supported on this platform"
                )));
            }
        }
        .map_err(|e| TestnetError::ConnectionFailed(e.to_string()))?;

        let client = client
            .negotiate_version()
            .await
            .map_err(|e| TestnetError::ConnectionFailed(format!("version negotiation: {e}")))?;

        debug!(version = ?client.client_version(), "connected to Docker");
        Ok(Self {
            client,
            exec_exit_timeout: Duration::from_secs(config.exec_exit_timeout_secs),
        })
    }

    /// Wrap an existing bollard client.
    #[must_use]
    pub fn from_client(client: Docker) -> Self {
        Self {
            client,
            exec_exit_timeout: Duration::from_secs(EngineConfig::default().exec_exit_timeout_secs),
        }
    }

    /// Get the underlying client.
    #[must_use]
    pub fn client(&self) -> &Docker {
        &self.client
    }

    async fn pull_image(&self, image: &str) -> TestnetResult<()> {
        let (from_image, tag) = split_image_ref(image);
        info!(image, "pulling image");

        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        self.client
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| map_error(ResourceKind::Image, image, "pull image", e))?;

        info!(image, "image pulled");
        Ok(())
    }

    async fn prune_volumes_with(
        &self,
        label_filter: &str,
        include_named: bool,
    ) -> Result<Vec<String>, BollardError> {
        let mut filters = label_filters(label_filter);
        if include_named {
            // API >= 1.42 only prunes anonymous volumes unless asked otherwise
            filters.insert("all".to_string(), vec!["true".to_string()]);
        }
        let response = self
            .client
            .prune_volumes(Some(PruneVolumesOptions { filters }))
            .await?;
        Ok(response.volumes_deleted.unwrap_or_default())
    }
}

/// Map a bollard error onto the crate taxonomy.
fn map_error(
    kind: ResourceKind,
    name: &str,
    operation: &'static str,
    err: BollardError,
) -> TestnetError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => TestnetError::NotFound {
            kind,
            name: name.to_string(),
        },
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => TestnetError::Conflict {
            kind,
            name: name.to_string(),
            message,
        },
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => TestnetError::Engine {
            operation,
            status: Some(status_code),
            message,
        },
        other => TestnetError::Engine {
            operation,
            status: None,
            message: other.to_string(),
        },
    }
}

fn label_filters(label_filter: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![label_filter.to_string()])])
}

/// Split an image reference into `fromImage` and `tag` pull parameters.
///
/// Untagged references get `latest`; otherwise the engine would pull every
/// tag of the repository.
fn split_image_ref(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let last_slash = image.rfind('/').map_or(0, |i| i + 1);
    match image[last_slash..].rfind(':') {
        Some(colon) => {
            let split = last_slash + colon;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

fn to_bollard_mount(mount: &Mount) -> BollardMount {
    BollardMount {
        target: Some(mount.target.clone()),
        source: Some(mount.source.clone()),
        typ: Some(match mount.kind {
            MountType::Volume => MountTypeEnum::VOLUME,
            MountType::Bind => MountTypeEnum::BIND,
        }),
        read_only: Some(mount.read_only),
        ..Default::default()
    }
}

/// Build Docker `HostConfig` from a container spec.
fn build_host_config(spec: &ContainerSpec) -> HostConfig {
    let mut host_config = HostConfig::default();

    let mounts: Vec<BollardMount> = spec.mounts.iter().map(to_bollard_mount).collect();
    if !mounts.is_empty() {
        host_config.mounts = Some(mounts);
    }

    // Empty host port: the engine picks a free one at start
    if !spec.ports.is_empty() {
        let bindings: PortMap = spec
            .ports
            .iter()
            .map(|port| {
                (
                    port.clone(),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(String::new()),
                    }]),
                )
            })
            .collect();
        host_config.port_bindings = Some(bindings);
    }

    if let Some(ref network) = spec.network {
        host_config.network_mode = Some(network.network.clone());
    }

    host_config
}

fn state_from_bollard(state: Option<&BollardState>) -> ContainerState {
    match state.and_then(|s| s.status.as_ref()) {
        Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerState::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
        _ => ContainerState::Unknown,
    }
}

fn host_bindings(ports: PortMap) -> HashMap<String, Vec<HostBinding>> {
    ports
        .into_iter()
        .map(|(spec, bindings)| {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .filter_map(|b| {
                    let host_port = b.host_port.filter(|p| !p.is_empty())?;
                    Some(HostBinding {
                        host_ip: b.host_ip.unwrap_or_default(),
                        host_port,
                    })
                })
                .collect();
            (spec, bindings)
        })
        .collect()
}

impl ContainerEngine for DockerEngine {
    fn ping(&self) -> EngineFuture<'_, ()> {
        Box::pin(async move {
            self.client
                .ping()
                .await
                .map_err(|e| TestnetError::ConnectionFailed(e.to_string()))?;
            Ok(())
        })
    }

    fn ensure_image<'a>(&'a self, image: &'a str, policy: PullPolicy) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            if policy == PullPolicy::Always {
                return self.pull_image(image).await;
            }

            match self.client.inspect_image(image).await {
                Ok(_) => Ok(()),
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) if policy == PullPolicy::IfMissing => self.pull_image(image).await,
                Err(e) => Err(map_error(ResourceKind::Image, image, "inspect image", e)),
            }
        })
    }

    fn create_network<'a>(&'a self, request: &'a NetworkRequest) -> EngineFuture<'a, String> {
        Box::pin(async move {
            debug!(name = %request.name, subnet = %request.subnet, "creating network");

            let options = CreateNetworkOptions {
                name: request.name.clone(),
                driver: "bridge".to_string(),
                labels: request.labels.clone(),
                ipam: Ipam {
                    config: Some(vec![IpamConfig {
                        subnet: Some(request.subnet.to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            };

            self.client
                .create_network(options)
                .await
                .map_err(|e| map_error(ResourceKind::Network, &request.name, "create network", e))?;

            let network = self
                .client
                .inspect_network(&request.name, None::<InspectNetworkOptions<String>>)
                .await
                .map_err(|e| {
                    map_error(ResourceKind::Network, &request.name, "inspect network", e)
                })?;

            let id = network.id.unwrap_or_else(|| request.name.clone());
            info!(id = %id, name = %request.name, subnet = %request.subnet, "network created");
            Ok(id)
        })
    }

    fn list_networks<'a>(
        &'a self,
        label_filter: Option<&'a str>,
    ) -> EngineFuture<'a, Vec<NetworkSummary>> {
        Box::pin(async move {
            let options = label_filter.map(|filter| ListNetworksOptions {
                filters: label_filters(filter),
            });

            let networks = self
                .client
                .list_networks(options)
                .await
                .map_err(|e| map_error(ResourceKind::Network, "*", "list networks", e))?;

            Ok(networks
                .into_iter()
                .map(|n| NetworkSummary {
                    id: n.id.unwrap_or_default(),
                    name: n.name.unwrap_or_default(),
                    subnets: n
                        .ipam
                        .and_then(|ipam| ipam.config)
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|c| c.subnet)
                        .collect(),
                    labels: n.labels.unwrap_or_default(),
                })
                .collect())
        })
    }

    fn remove_network<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .remove_network(id)
                .await
                .map_err(|e| map_error(ResourceKind::Network, id, "remove network", e))?;
            info!(id = %id, "network removed");
            Ok(())
        })
    }

    fn prune_networks<'a>(&'a self, label_filter: &'a str) -> EngineFuture<'a, Vec<String>> {
        Box::pin(async move {
            let response = self
                .client
                .prune_networks(Some(PruneNetworksOptions {
                    filters: label_filters(label_filter),
                }))
                .await
                .map_err(|e| map_error(ResourceKind::Network, label_filter, "prune networks", e))?;
            Ok(response.networks_deleted.unwrap_or_default())
        })
    }

    fn create_volume<'a>(
        &'a self,
        name: &'a str,
        labels: &'a HashMap<String, String>,
    ) -> EngineFuture<'a, VolumeInfo> {
        Box::pin(async move {
            let options = CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                labels: labels.clone(),
                ..Default::default()
            };

            let volume = self
                .client
                .create_volume(options)
                .await
                .map_err(|e| map_error(ResourceKind::Volume, name, "create volume", e))?;

            info!(name = %volume.name, "volume created");
            Ok(VolumeInfo {
                name: volume.name,
                labels: volume.labels,
            })
        })
    }

    fn inspect_volume<'a>(&'a self, name: &'a str) -> EngineFuture<'a, VolumeInfo> {
        Box::pin(async move {
            let volume = self
                .client
                .inspect_volume(name)
                .await
                .map_err(|e| map_error(ResourceKind::Volume, name, "inspect volume", e))?;
            Ok(VolumeInfo {
                name: volume.name,
                labels: volume.labels,
            })
        })
    }

    fn list_volumes<'a>(&'a self, label_filter: &'a str) -> EngineFuture<'a, Vec<VolumeInfo>> {
        Box::pin(async move {
            let response = self
                .client
                .list_volumes(Some(ListVolumesOptions {
                    filters: label_filters(label_filter),
                }))
                .await
                .map_err(|e| map_error(ResourceKind::Volume, label_filter, "list volumes", e))?;

            Ok(response
                .volumes
                .unwrap_or_default()
                .into_iter()
                .map(|v| VolumeInfo {
                    name: v.name,
                    labels: v.labels,
                })
                .collect())
        })
    }

    fn remove_volume<'a>(&'a self, name: &'a str, force: bool) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .remove_volume(name, Some(RemoveVolumeOptions { force }))
                .await
                .map_err(|e| map_error(ResourceKind::Volume, name, "remove volume", e))?;
            info!(name = %name, "volume removed");
            Ok(())
        })
    }

    fn prune_volumes<'a>(&'a self, label_filter: &'a str) -> EngineFuture<'a, Vec<String>> {
        Box::pin(async move {
            match self.prune_volumes_with(label_filter, true).await {
                Ok(removed) => Ok(removed),
                Err(BollardError::DockerResponseServerError {
                    status_code: 400,
                    message,
                }) if message.contains("filter") => {
                    // Older daemons reject the `all` filter
                    debug!(message = %message, "retrying volume prune without `all` filter");
                    self.prune_volumes_with(label_filter, false)
                        .await
                        .map_err(|e| {
                            map_error(ResourceKind::Volume, label_filter, "prune volumes", e)
                        })
                }
                Err(e) => Err(map_error(
                    ResourceKind::Volume,
                    label_filter,
                    "prune volumes",
                    e,
                )),
            }
        })
    }

    fn create_container<'a>(&'a self, spec: &'a ContainerSpec) -> EngineFuture<'a, String> {
        Box::pin(async move {
            debug!(name = %spec.name, image = %spec.image, "creating container");

            let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
                .ports
                .iter()
                .map(|port| (port.clone(), HashMap::new()))
                .collect();

            let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
                endpoints_config: HashMap::from([(
                    network.network.clone(),
                    EndpointSettings {
                        aliases: Some(network.aliases.clone()),
                        ..Default::default()
                    },
                )]),
            });

            let docker_config = Config {
                image: Some(spec.image.clone()),
                hostname: spec.hostname.clone(),
                cmd: spec.cmd.clone(),
                entrypoint: spec.entrypoint.clone(),
                env: Some(spec.env.clone()),
                user: spec.user.clone(),
                working_dir: spec.working_dir.clone(),
                labels: Some(spec.labels.clone()),
                exposed_ports: if exposed_ports.is_empty() {
                    None
                } else {
                    Some(exposed_ports)
                },
                host_config: Some(build_host_config(spec)),
                networking_config,
                ..Default::default()
            };

            let options = CreateContainerOptions {
                name: spec.name.clone(),
                platform: None,
            };

            let response = self
                .client
                .create_container(Some(options), docker_config)
                .await
                .map_err(|e| match e {
                    BollardError::DockerResponseServerError {
                        status_code: 404, ..
                    } => TestnetError::NotFound {
                        kind: ResourceKind::Image,
                        name: spec.image.clone(),
                    },
                    other => map_error(ResourceKind::Container, &spec.name, "create container", other),
                })?;

            for warning in &response.warnings {
                warn!(name = %spec.name, warning = %warning, "engine warning on create");
            }
            info!(id = %response.id, name = %spec.name, "container created");
            Ok(response.id)
        })
    }

    fn start_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            debug!(id = %id, "starting container");
            self.client
                .start_container::<String>(id, None)
                .await
                .map_err(|e| map_error(ResourceKind::Container, id, "start container", e))?;
            info!(id = %id, "container started");
            Ok(())
        })
    }

    fn stop_container<'a>(&'a self, id: &'a str, timeout_secs: i64) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            debug!(id = %id, timeout_secs, "stopping container");

            match self
                .client
                .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
                .await
            {
                Ok(()) => {
                    info!(id = %id, "container stopped");
                    Ok(())
                }
                Err(BollardError::DockerResponseServerError {
                    status_code: 304, ..
                }) => {
                    // Already stopped, not an error
                    Ok(())
                }
                Err(e) => Err(map_error(ResourceKind::Container, id, "stop container", e)),
            }
        })
    }

    fn wait_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, i64> {
        Box::pin(async move {
            let options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut stream = self.client.wait_container(id, Some(options));

            match stream.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // bollard reports non-zero exits as an error carrying the code
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(map_error(ResourceKind::Container, id, "wait container", e)),
                None => Err(TestnetError::Engine {
                    operation: "wait container",
                    status: None,
                    message: "wait stream ended unexpectedly".to_string(),
                }),
            }
        })
    }

    fn remove_container<'a>(&'a self, id: &'a str, force: bool) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            debug!(id = %id, force, "removing container");

            let options = RemoveContainerOptions {
                force,
                v: false,
                ..Default::default()
            };
            self.client
                .remove_container(id, Some(options))
                .await
                .map_err(|e| map_error(ResourceKind::Container, id, "remove container", e))?;

            info!(id = %id, "container removed");
            Ok(())
        })
    }

    fn inspect_container<'a>(&'a self, id: &'a str) -> EngineFuture<'a, ContainerDetails> {
        Box::pin(async move {
            let inspect = self
                .client
                .inspect_container(id, None::<InspectContainerOptions>)
                .await
                .map_err(|e| map_error(ResourceKind::Container, id, "inspect container", e))?;

            Ok(ContainerDetails {
                id: inspect.id.unwrap_or_default(),
                name: inspect
                    .name
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                state: state_from_bollard(inspect.state.as_ref()),
                exit_code: inspect.state.as_ref().and_then(|s| s.exit_code),
                labels: inspect
                    .config
                    .and_then(|c| c.labels)
                    .unwrap_or_default(),
                ports: inspect
                    .network_settings
                    .and_then(|n| n.ports)
                    .map(host_bindings)
                    .unwrap_or_default(),
            })
        })
    }

    fn list_containers<'a>(
        &'a self,
        label_filter: Option<&'a str>,
        all: bool,
    ) -> EngineFuture<'a, Vec<ContainerSummary>> {
        Box::pin(async move {
            let options = ListContainersOptions {
                all,
                filters: label_filter.map(label_filters).unwrap_or_default(),
                ..Default::default()
            };

            let containers = self
                .client
                .list_containers(Some(options))
                .await
                .map_err(|e| map_error(ResourceKind::Container, "*", "list containers", e))?;

            Ok(containers
                .into_iter()
                .map(|c| ContainerSummary {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .and_then(|n| n.first().cloned())
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    state: c
                        .state
                        .as_deref()
                        .map_or(ContainerState::Unknown, ContainerState::from_status),
                    labels: c.labels.unwrap_or_default(),
                })
                .collect())
        })
    }

    fn logs<'a>(&'a self, id: &'a str, tail: Option<usize>) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let options = LogsOptions {
                stdout: true,
                stderr: true,
                tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
                follow: false,
                ..Default::default()
            };

            let mut stream = self.client.logs(id, Some(options));
            let mut output = Vec::new();

            while let Some(result) = stream.next().await {
                match result {
                    Ok(chunk) => output.extend_from_slice(&chunk.into_bytes()),
                    Err(BollardError::DockerResponseServerError {
                        status_code: 404, ..
                    }) => {
                        return Err(TestnetError::NotFound {
                            kind: ResourceKind::Container,
                            name: id.to_string(),
                        });
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "error reading logs");
                        break;
                    }
                }
            }

            Ok(output)
        })
    }

    fn exec<'a>(&'a self, id: &'a str, request: &'a ExecRequest) -> EngineFuture<'a, ExecOutput> {
        Box::pin(async move {
            debug!(id = %id, cmd = ?request.cmd, "executing command");

            let options = CreateExecOptions {
                cmd: Some(request.cmd.clone()),
                env: Some(request.env.clone()),
                user: request.user.clone(),
                working_dir: request.working_dir.clone(),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(false),
                ..Default::default()
            };

            let exec = self
                .client
                .create_exec(id, options)
                .await
                .map_err(|e| map_error(ResourceKind::Container, id, "create exec", e))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();

            let started = self
                .client
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| map_error(ResourceKind::Exec, &exec.id, "start exec", e))?;

            if let StartExecResults::Attached { mut output, .. } = started {
                while let Some(chunk) = output.next().await {
                    match chunk
                        .map_err(|e| map_error(ResourceKind::Exec, &exec.id, "read exec output", e))?
                    {
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message);
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }

            // The exit code can lag the end of the output stream
            let deadline = tokio::time::Instant::now() + self.exec_exit_timeout;
            let exit_code = loop {
                let inspect = self
                    .client
                    .inspect_exec(&exec.id)
                    .await
                    .map_err(|e| map_error(ResourceKind::Exec, &exec.id, "inspect exec", e))?;
                if let Some(settled) = settled_exit_code(&exec.id, &inspect) {
                    break settled?;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(TestnetError::Engine {
                        operation: "inspect exec",
                        status: None,
                        message: format!(
                            "exec {} still running {:?} after its output closed",
                            exec.id, self.exec_exit_timeout
                        ),
                    });
                }
                tokio::time::sleep(EXEC_POLL_INTERVAL).await;
            };
            Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
            })
        })
    }

    fn upload_archive<'a>(
        &'a self,
        id: &'a str,
        dest_dir: &'a str,
        archive: Vec<u8>,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            let options = UploadToContainerOptions {
                path: dest_dir.to_string(),
                ..Default::default()
            };
            self.client
                .upload_to_container(id, Some(options), archive.into())
                .await
                .map_err(|e| map_error(ResourceKind::Container, id, "upload archive", e))?;
            Ok(())
        })
    }

    fn download_archive<'a>(&'a self, id: &'a str, path: &'a str) -> EngineFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let options = DownloadFromContainerOptions {
                path: path.to_string(),
            };
            let chunks = self
                .client
                .download_from_container(id, Some(options))
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| map_error(ResourceKind::File, path, "download archive", e))?;

            let mut archive = Vec::new();
            for chunk in chunks {
                archive.extend_from_slice(&chunk);
            }
            Ok(archive)
        })
    }
}

/// Exit code of a finished exec, or `None` while it still runs.
fn settled_exit_code(exec_id: &str, inspect: &ExecInspectResponse) -> Option<TestnetResult<i64>> {
    if inspect.running == Some(true) {
        return None;
    }
    Some(inspect.exit_code.ok_or_else(|| TestnetError::Engine {
        operation: "inspect exec",
        status: None,
        message: format!("exec {exec_id} finished without an exit code"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NetworkAttachment;

    // =========================================================================
    // Unit Tests (no Docker required)
    // =========================================================================

    #[test]
    fn test_settled_exit_code() {
        let running = ExecInspectResponse {
            running: Some(true),
            exit_code: None,
            ..Default::default()
        };
        assert!(settled_exit_code("e1", &running).is_none());

        let done = ExecInspectResponse {
            running: Some(false),
            exit_code: Some(3),
            ..Default::default()
        };
        assert!(matches!(settled_exit_code("e1", &done), Some(Ok(3))));

        let lost = ExecInspectResponse {
            running: Some(false),
            exit_code: None,
            ..Default::default()
        };
        assert!(matches!(
            settled_exit_code("e1", &lost),
            Some(Err(TestnetError::Engine { .. }))
        ));
    }

    #[test]
    fn test_split_image_ref() {
        assert_eq!(
            split_image_ref("busybox"),
            ("busybox".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_ref("ghcr.io/example/node-app:v3.0.0"),
            (
                "ghcr.io/example/node-app".to_string(),
                "v3.0.0".to_string()
            )
        );
        assert_eq!(
            split_image_ref("localhost:5000/app"),
            ("localhost:5000/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_image_ref("alpine@sha256:abcd"),
            ("alpine@sha256:abcd".to_string(), String::new())
        );
    }

    #[test]
    fn test_build_host_config_ports_are_dynamic() {
        let spec = ContainerSpec {
            name: "val-0".to_string(),
            image: "busybox".to_string(),
            ports: vec!["26657/tcp".to_string(), "9090/tcp".to_string()],
            ..Default::default()
        };

        let host_config = build_host_config(&spec);
        let bindings = host_config.port_bindings.expect("port bindings");
        assert_eq!(bindings.len(), 2);
        let binding = bindings
            .get("26657/tcp")
            .and_then(Clone::clone)
            .expect("binding for rpc port");
        assert_eq!(binding[0].host_port, Some(String::new()));
    }

    #[test]
    fn test_build_host_config_mounts_and_network() {
        let spec = ContainerSpec {
            name: "val-0".to_string(),
            image: "busybox".to_string(),
            mounts: vec![
                Mount::volume("val-0-data", "/home/node"),
                Mount::bind("/host/keys", "/keys").read_only(),
            ],
            network: Some(NetworkAttachment {
                network: "net-1".to_string(),
                aliases: vec!["val-0".to_string()],
            }),
            ..Default::default()
        };

        let host_config = build_host_config(&spec);
        let mounts = host_config.mounts.expect("mounts");
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(mounts[1].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[1].read_only, Some(true));
        assert_eq!(host_config.network_mode, Some("net-1".to_string()));
    }

    #[test]
    fn test_state_from_bollard() {
        let running = BollardState {
            status: Some(ContainerStateStatusEnum::RUNNING),
            ..Default::default()
        };
        assert_eq!(state_from_bollard(Some(&running)), ContainerState::Running);

        let exited = BollardState {
            status: Some(ContainerStateStatusEnum::EXITED),
            ..Default::default()
        };
        assert_eq!(state_from_bollard(Some(&exited)), ContainerState::Exited);
        assert_eq!(state_from_bollard(None), ContainerState::Unknown);
    }

    #[test]
    fn test_host_bindings_skip_unassigned() {
        let ports: PortMap = HashMap::from([
            (
                "26657/tcp".to_string(),
                Some(vec![
                    PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some("49153".to_string()),
                    },
                    PortBinding {
                        host_ip: Some("::".to_string()),
                        host_port: Some(String::new()),
                    },
                ]),
            ),
            ("1317/tcp".to_string(), None),
        ]);

        let bindings = host_bindings(ports);
        assert_eq!(bindings["26657/tcp"].len(), 1);
        assert_eq!(bindings["26657/tcp"][0].host_port, "49153");
        assert!(bindings["1317/tcp"].is_empty());
    }

    #[test]
    fn test_map_error_status_codes() {
        let not_found = map_error(
            ResourceKind::Volume,
            "v",
            "inspect volume",
            BollardError::DockerResponseServerError {
                status_code: 404,
                message: "no such volume".to_string(),
            },
        );
        assert!(not_found.is_not_found());

        let conflict = map_error(
            ResourceKind::Volume,
            "prune",
            "prune volumes",
            BollardError::DockerResponseServerError {
                status_code: 409,
                message: "a prune operation is already running".to_string(),
            },
        );
        assert!(conflict.is_prune_in_progress());

        let other = map_error(
            ResourceKind::Container,
            "c",
            "start container",
            BollardError::DockerResponseServerError {
                status_code: 500,
                message: "boom".to_string(),
            },
        );
        assert!(matches!(
            other,
            TestnetError::Engine {
                status: Some(500),
                ..
            }
        ));
    }

    // =========================================================================
    // Integration Tests (require Docker)
    // =========================================================================

    #[tokio::test]
    #[ignore = "requires Docker daemon"]
    async fn test_docker_ping() {
        let engine = DockerEngine::connect(&EngineConfig::default())
            .await
            .expect("connect");
        engine.ping().await.expect("ping should succeed");
    }
}
