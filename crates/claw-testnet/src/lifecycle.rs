//! Container and volume lifecycle of a single node.
//!
//! A node owns one named volume and, at most, one container. The volume name
//! is derived from the node name, so re-materializing a node with the same
//! name re-binds the data it had before. Files inside the volume are read and
//! written through short-lived helper containers, which works whether or not
//! the node's own container is running.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive;
use crate::config::RetentionPolicy;
use crate::engine::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerState, ExecRequest, Mount,
    NetworkAttachment, PullPolicy, VolumeInfo,
};
use crate::error::{ResourceKind, TestnetError, TestnetResult};
use crate::labels::{condense_hostname, helper_labels, node_labels};
use crate::network::Network;
use crate::ports::{HostPorts, PortResolver, PortTable};

/// Image used for helper containers.
pub const DEFAULT_HELPER_IMAGE: &str = "busybox:1.36";

/// Where helper containers mount the node volume.
pub const VOLUME_MOUNT_POINT: &str = "/mnt/volume";

/// Slack on top of the engine-side stop timeout before giving up locally.
const STOP_SLACK: Duration = Duration::from_secs(5);

/// Volume name for a node.
#[must_use]
pub fn volume_name_for(node_name: &str) -> String {
    format!("{node_name}-data")
}

/// What to delete when a node's resources are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Keep the node's volume for a later re-bind.
    pub keep_volume: bool,
    /// Kill the container if it is still running.
    pub force: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            keep_volume: false,
            force: true,
        }
    }
}

impl RemoveOptions {
    /// Options implied by a retention policy.
    #[must_use]
    pub fn from_policy(policy: &RetentionPolicy) -> Self {
        Self {
            keep_volume: policy.keep_volumes_on_remove,
            ..Self::default()
        }
    }

    /// Override volume retention.
    #[must_use]
    pub fn with_keep_volume(mut self, keep: bool) -> Self {
        self.keep_volume = keep;
        self
    }
}

/// Parameters of a node's container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerParams {
    /// Image reference.
    pub image: String,
    /// Pull behavior.
    pub pull_policy: PullPolicy,
    /// Command override.
    pub cmd: Option<Vec<String>>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Environment (`KEY=VALUE`).
    pub env: Vec<String>,
    /// Declared ports.
    pub ports: PortTable,
    /// Mounts in addition to the node volume.
    pub extra_mounts: Vec<Mount>,
}

/// Engine resources of one node: its volume and its container.
pub struct NodeResources {
    engine: Arc<dyn ContainerEngine>,
    test_id: String,
    node_name: String,
    volume_name: String,
    home_dir: String,
    user: Option<String>,
    helper_image: String,
    container_id: RwLock<Option<String>>,
}

impl std::fmt::Debug for NodeResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeResources")
            .field("node_name", &self.node_name)
            .field("volume_name", &self.volume_name)
            .field("container_id", &*self.container_id.read())
            .finish_non_exhaustive()
    }
}

impl NodeResources {
    /// Describe the resources of `node_name`, mounting its volume at `home_dir`.
    #[must_use]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        test_id: impl Into<String>,
        node_name: impl Into<String>,
        home_dir: impl Into<String>,
    ) -> Self {
        let node_name = node_name.into();
        Self {
            engine,
            test_id: test_id.into(),
            volume_name: volume_name_for(&node_name),
            node_name,
            home_dir: home_dir.into(),
            user: None,
            helper_image: DEFAULT_HELPER_IMAGE.to_string(),
            container_id: RwLock::new(None),
        }
    }

    /// Run the container, and own the volume, as `uid:gid`.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Use a different helper image.
    #[must_use]
    pub fn with_helper_image(mut self, image: impl Into<String>) -> Self {
        self.helper_image = image.into();
        self
    }

    /// Node name.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Volume name.
    #[must_use]
    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    /// Home directory the volume is mounted at.
    #[must_use]
    pub fn home_dir(&self) -> &str {
        &self.home_dir
    }

    /// Container ID, once created.
    #[must_use]
    pub fn container_id(&self) -> Option<String> {
        self.container_id.read().clone()
    }

    fn require_container(&self) -> TestnetResult<String> {
        self.container_id().ok_or_else(|| TestnetError::NoContainer {
            node: self.node_name.clone(),
        })
    }

    /// Look up the node's volume, creating and chowning it on first use.
    ///
    /// # Errors
    ///
    /// Returns error if the volume cannot be inspected, created or chowned.
    pub async fn create_and_setup_volume(&self) -> TestnetResult<VolumeInfo> {
        match self.engine.inspect_volume(&self.volume_name).await {
            Ok(volume) => {
                info!(node = %self.node_name, volume = %volume.name, "reusing existing volume");
                return Ok(volume);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let labels = node_labels(&self.test_id, &self.node_name);
        let volume = self.engine.create_volume(&self.volume_name, &labels).await?;
        info!(node = %self.node_name, volume = %volume.name, "volume created");

        if let Some(ref user) = self.user {
            self.run_helper(chown_cmd(user)).await?;
            debug!(node = %self.node_name, user = %user, "volume ownership set");
        }

        Ok(volume)
    }

    /// Create the node's container without starting it.
    ///
    /// The volume is mounted at the home directory and the container joins
    /// `network` under its (condensed) hostname.
    ///
    /// # Errors
    ///
    /// Returns error if the image is unavailable or creation fails.
    pub async fn create_container(
        &self,
        network: &Network,
        params: &ContainerParams,
    ) -> TestnetResult<String> {
        if let Some(id) = self.container_id() {
            return Err(TestnetError::Conflict {
                kind: ResourceKind::Container,
                name: self.node_name.clone(),
                message: format!("container {id} already created"),
            });
        }

        self.engine
            .ensure_image(&params.image, params.pull_policy)
            .await?;

        let hostname = condense_hostname(&self.node_name);
        let mut mounts = vec![Mount::volume(&self.volume_name, &self.home_dir)];
        mounts.extend(params.extra_mounts.iter().cloned());

        let spec = ContainerSpec {
            name: self.node_name.clone(),
            image: params.image.clone(),
            hostname: Some(hostname.clone()),
            cmd: params.cmd.clone(),
            entrypoint: params.entrypoint.clone(),
            env: params.env.clone(),
            user: self.user.clone(),
            working_dir: None,
            labels: node_labels(&self.test_id, &self.node_name),
            ports: params.ports.engine_specs(),
            mounts,
            network: Some(NetworkAttachment {
                network: network.id().to_string(),
                aliases: vec![hostname],
            }),
        };

        let id = self.engine.create_container(&spec).await?;
        *self.container_id.write() = Some(id.clone());
        Ok(id)
    }

    /// Start the container.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NoContainer`] before creation, or the engine error.
    pub async fn start(&self) -> TestnetResult<()> {
        let id = self.require_container()?;
        self.engine.start_container(&id).await?;
        info!(node = %self.node_name, id = %id, "node container started");
        Ok(())
    }

    /// Stop the container and wait for it to exit.
    ///
    /// The engine kills the container after `timeout`. If `cancel` fires
    /// while waiting, the container is force-removed before returning.
    /// A node with no container recorded is already stopped.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::Cancelled`], [`TestnetError::StopTimeout`] or
    /// the engine error.
    pub async fn stop(&self, cancel: &CancellationToken, timeout: Duration) -> TestnetResult<()> {
        let Some(id) = self.container_id() else {
            debug!(node = %self.node_name, "no container to stop");
            return Ok(());
        };
        let secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);

        let stop_and_wait = async {
            self.engine.stop_container(&id, secs).await?;
            self.engine.wait_container(&id).await
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                warn!(node = %self.node_name, id = %id, "stop cancelled, force-removing container");
                match self.engine.remove_container(&id, true).await {
                    Ok(()) => {
                        self.container_id.write().take();
                    }
                    Err(e) if e.is_not_found() => {
                        self.container_id.write().take();
                    }
                    Err(e) => warn!(node = %self.node_name, error = %e, "force-remove after cancel failed"),
                }
                Err(TestnetError::Cancelled(format!("stop of {}", self.node_name)))
            }
            result = tokio::time::timeout(timeout + STOP_SLACK, stop_and_wait) => match result {
                Ok(Ok(exit_code)) => {
                    info!(node = %self.node_name, id = %id, exit_code, "node container stopped");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TestnetError::StopTimeout {
                    target: self.node_name.clone(),
                    timeout,
                }),
            },
        }
    }

    /// Remove the container and, unless kept, the volume.
    ///
    /// Missing resources are not an error.
    ///
    /// # Errors
    ///
    /// Returns the first engine error other than not-found.
    pub async fn remove(&self, opts: RemoveOptions) -> TestnetResult<()> {
        if let Some(id) = self.container_id() {
            match self.engine.remove_container(&id, opts.force).await {
                Ok(()) => info!(node = %self.node_name, id = %id, "node container removed"),
                Err(e) if e.is_not_found() => {
                    debug!(node = %self.node_name, id = %id, "container already gone");
                }
                Err(e) => return Err(e),
            }
            self.container_id.write().take();
        }

        if opts.keep_volume {
            debug!(node = %self.node_name, volume = %self.volume_name, "keeping volume");
            return Ok(());
        }

        match self.engine.remove_volume(&self.volume_name, true).await {
            Ok(()) => {
                info!(node = %self.node_name, volume = %self.volume_name, "volume removed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read a file from the volume, relative to its root.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NotFound`] for a missing file, or any helper failure.
    pub async fn read_file(&self, rel_path: &str) -> TestnetResult<Vec<u8>> {
        let rel = checked_rel_path(rel_path)?;
        let helper = self.create_helper(vec!["true".to_string()]).await?;

        let path = format!("{VOLUME_MOUNT_POINT}/{rel}");
        let result = self.engine.download_archive(&helper, &path).await;
        self.remove_helper(&helper).await;

        let bytes = archive::unpack_single(&result?, &path)?;
        debug!(node = %self.node_name, path = %rel, bytes = bytes.len(), "read file from volume");
        Ok(bytes)
    }

    /// Write a file into the volume, relative to its root.
    ///
    /// Parent directories are created; the volume is re-owned by the node user.
    ///
    /// # Errors
    ///
    /// Returns error if the upload or the ownership fix fails.
    pub async fn write_file(&self, rel_path: &str, contents: &[u8]) -> TestnetResult<()> {
        let rel = checked_rel_path(rel_path)?;
        let tar = archive::pack_file(&rel, contents, 0o644)?;

        let cmd = match self.user {
            Some(ref user) => chown_cmd(user),
            None => vec!["true".to_string()],
        };
        let helper = self.create_helper(cmd).await?;

        let result = async {
            self.engine
                .upload_archive(&helper, VOLUME_MOUNT_POINT, tar)
                .await?;
            if self.user.is_some() {
                self.start_and_wait_helper(&helper).await?;
            }
            Ok::<(), TestnetError>(())
        }
        .await;
        self.remove_helper(&helper).await;

        result?;
        debug!(node = %self.node_name, path = %rel, bytes = contents.len(), "wrote file to volume");
        Ok(())
    }

    /// Run a command in the running container.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NoContainer`] before creation,
    /// [`TestnetError::ExecFailed`] on a non-zero exit, or
    /// [`TestnetError::Cancelled`].
    pub async fn exec(
        &self,
        cancel: &CancellationToken,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> TestnetResult<(String, String)> {
        let id = self.require_container()?;
        let request = ExecRequest::cmd(cmd)
            .with_env(env)
            .with_working_dir(&self.home_dir);

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(TestnetError::Cancelled(format!(
                    "exec {:?} on {}",
                    request.cmd, self.node_name
                )));
            }
            output = self.engine.exec(&id, &request) => output?,
        };

        if !output.success() {
            return Err(TestnetError::ExecFailed {
                target: self.node_name.clone(),
                cmd: request.cmd,
                exit_code: output.exit_code,
                stdout: output.stdout_str(),
                stderr: output.stderr_str(),
            });
        }
        Ok((output.stdout_str(), output.stderr_str()))
    }

    /// Container logs, optionally only the last `tail` lines.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NoContainer`] before creation, or the engine error.
    pub async fn logs(&self, tail: Option<usize>) -> TestnetResult<String> {
        let id = self.require_container()?;
        let bytes = self.engine.logs(&id, tail).await?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// Inspect the container.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NoContainer`] before creation, or the engine error.
    pub async fn inspect(&self) -> TestnetResult<ContainerDetails> {
        let id = self.require_container()?;
        self.engine.inspect_container(&id).await
    }

    /// Current container state.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NoContainer`] before creation, or the engine error.
    pub async fn state(&self) -> TestnetResult<ContainerState> {
        Ok(self.inspect().await?.state)
    }

    /// Host addresses of the declared ports; the container must be running.
    ///
    /// # Errors
    ///
    /// Returns [`TestnetError::NotRunning`] or a resolution failure.
    pub async fn host_ports(&self, table: &PortTable) -> TestnetResult<HostPorts> {
        let id = self.require_container()?;
        PortResolver::host_ports(self.engine.as_ref(), &id, &self.node_name, table).await
    }

    async fn create_helper(&self, cmd: Vec<String>) -> TestnetResult<String> {
        self.engine
            .ensure_image(&self.helper_image, PullPolicy::IfMissing)
            .await?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let spec = ContainerSpec {
            name: format!("{}-helper-{}", self.node_name, &suffix[..8]),
            image: self.helper_image.clone(),
            cmd: Some(cmd),
            entrypoint: Some(Vec::new()),
            user: Some("0:0".to_string()),
            labels: helper_labels(&self.test_id, &self.node_name),
            mounts: vec![Mount::volume(&self.volume_name, VOLUME_MOUNT_POINT)],
            ..ContainerSpec::default()
        };
        self.engine.create_container(&spec).await
    }

    async fn start_and_wait_helper(&self, helper: &str) -> TestnetResult<()> {
        self.engine.start_container(helper).await?;
        let exit_code = self.engine.wait_container(helper).await?;
        if exit_code == 0 {
            return Ok(());
        }

        let logs = self.engine.logs(helper, None).await.unwrap_or_default();
        Err(TestnetError::ExecFailed {
            target: format!("{} helper", self.node_name),
            cmd: Vec::new(),
            exit_code,
            stdout: String::from_utf8_lossy(&logs).to_string(),
            stderr: String::new(),
        })
    }

    async fn run_helper(&self, cmd: Vec<String>) -> TestnetResult<()> {
        let helper = self.create_helper(cmd.clone()).await?;
        let result = self.start_and_wait_helper(&helper).await;
        self.remove_helper(&helper).await;

        result.map_err(|e| match e {
            TestnetError::ExecFailed {
                target,
                exit_code,
                stdout,
                stderr,
                ..
            } => TestnetError::ExecFailed {
                target,
                cmd,
                exit_code,
                stdout,
                stderr,
            },
            other => other,
        })
    }

    async fn remove_helper(&self, helper: &str) {
        if let Err(e) = self.engine.remove_container(helper, true).await {
            if !e.is_not_found() {
                warn!(node = %self.node_name, helper = %helper, error = %e, "failed to remove helper container");
            }
        }
    }
}

/// Validate a volume-relative path; absolute prefixes are stripped.
/// Recursive ownership fix of the whole volume, as run by helpers.
fn chown_cmd(user: &str) -> Vec<String> {
    vec![
        "chown".to_string(),
        "-R".to_string(),
        user.to_string(),
        VOLUME_MOUNT_POINT.to_string(),
    ]
}

fn checked_rel_path(rel_path: &str) -> TestnetResult<String> {
    let rel = rel_path.trim_start_matches('/');
    if rel.is_empty() || rel.split('/').any(|part| part == "..") {
        return Err(TestnetError::InvalidConfig(format!(
            "invalid volume path: {rel_path:?}"
        )));
    }
    Ok(rel.to_string())
}
