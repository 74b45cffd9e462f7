use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::{
    models::{ContainerCreateBody, HostConfig, NetworkCreateRequest},
    query_parameters::{
        CreateContainerOptions,
        CreateImageOptions,
        InspectContainerOptions,
        InspectNetworkOptions,
        KillContainerOptions,
        ListContainersOptions,
        RemoveContainerOptions,
        StartContainerOptions,
    },
    Docker,
};
use data_model::{duration_secs, ExecutionMode, FunctionConfig, RuntimeRequest, RuntimeResponse};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    client::RuntimeClient,
    readiness::wait_until_ready,
    runtime_environment,
    BackendHandle,
    ExecutionHandle,
    InstanceSpec,
    RuntimeHost,
};
use crate::error::HostError;

const MANAGED_LABEL: &str = "faas.managed";
const FUNCTION_LABEL: &str = "faas.function";
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_BASE_IMAGE: &str = "python:3.11-slim";
const DEFAULT_RUNTIME_PORT: u16 = 8080;
const DEFAULT_USER: &str = "1001:1001";
const DEFAULT_ISOLATED_NETWORK: &str = "faas-isolated";
const DEFAULT_TMPFS_SIZE: &str = "64m";
const DEFAULT_CODE_MOUNT_PATH: &str = "/function";
const DEFAULT_READINESS_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn default_runtime_command() -> Vec<String> {
    vec![
        "python3".to_string(),
        "-m".to_string(),
        "faas.runtime_host".to_string(),
    ]
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerHostConfig {
    #[serde_inline_default(true)]
    pub enabled: bool,
    /// Docker endpoint: `unix:///var/run/docker.sock`, a socket path, or
    /// `http://host:port`. Local defaults when unset.
    #[serde(default)]
    pub docker_address: Option<String>,
    #[serde_inline_default(DEFAULT_BASE_IMAGE.to_string())]
    pub base_image: String,
    #[serde_inline_default(default_runtime_command())]
    pub runtime_command: Vec<String>,
    #[serde_inline_default(DEFAULT_RUNTIME_PORT)]
    pub runtime_port: u16,
    #[serde_inline_default(DEFAULT_USER.to_string())]
    pub user: String,
    /// Internal bridge network for functions without network access.
    #[serde_inline_default(DEFAULT_ISOLATED_NETWORK.to_string())]
    pub isolated_network: String,
    #[serde_inline_default(DEFAULT_TMPFS_SIZE.to_string())]
    pub tmpfs_size: String,
    #[serde_inline_default(DEFAULT_CODE_MOUNT_PATH.to_string())]
    pub code_mount_path: String,
    #[serde_inline_default(DEFAULT_READINESS_POLL_INTERVAL)]
    #[serde(with = "duration_secs")]
    pub readiness_poll_interval: Duration,
    #[serde_inline_default("info".to_string())]
    pub log_level: String,
}

impl Default for ContainerHostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            docker_address: None,
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            runtime_command: default_runtime_command(),
            runtime_port: DEFAULT_RUNTIME_PORT,
            user: DEFAULT_USER.to_string(),
            isolated_network: DEFAULT_ISOLATED_NETWORK.to_string(),
            tmpfs_size: DEFAULT_TMPFS_SIZE.to_string(),
            code_mount_path: DEFAULT_CODE_MOUNT_PATH.to_string(),
            readiness_poll_interval: DEFAULT_READINESS_POLL_INTERVAL,
            log_level: "info".to_string(),
        }
    }
}

/// Runs each instance in a locked-down Docker container.
pub struct ContainerHost {
    docker: Docker,
    config: ContainerHostConfig,
    client: RuntimeClient,
}

fn connect(address: Option<&str>) -> Result<Docker> {
    let Some(address) = address else {
        return Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon");
    };
    let docker = if address.starts_with("http://") || address.starts_with("tcp://") {
        let addr = address
            .trim_start_matches("http://")
            .trim_start_matches("tcp://");
        Docker::connect_with_http(
            &format!("http://{}", addr),
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .context("Failed to connect to Docker daemon via HTTP")?
    } else {
        let socket_path = address.trim_start_matches("unix://");
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .context("Failed to connect to Docker daemon via Unix socket")?
    };
    Ok(docker)
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_conflict(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

fn container_name(spec: &InstanceSpec) -> String {
    format!("faas-{}", spec.instance_id)
}

impl ContainerHost {
    pub fn new(config: ContainerHostConfig) -> Result<Self> {
        if config.runtime_command.is_empty() {
            return Err(anyhow!("container host runtime_command must not be empty"));
        }
        let docker = connect(config.docker_address.as_deref())?;
        Ok(Self {
            docker,
            config,
            client: RuntimeClient::new()?,
        })
    }

    /// Removes containers a previous run left behind.
    pub async fn remove_stale_containers(&self) -> Result<usize> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            match self.remove_container(&id).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(container = %id, error = %format!("{err:#}"), "failed to remove stale container"),
            }
        }
        if removed > 0 {
            info!(removed, "removed stale function containers");
        }
        Ok(removed)
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err).context("Failed to inspect image"),
        }

        info!(image = %image, event = "image_pull_started", "Pulling Docker image");
        let start = Instant::now();
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(err) => {
                    error!(
                        image = %image,
                        duration_ms = start.elapsed().as_millis() as u64,
                        error = %err,
                        event = "image_pull_failed",
                        "Failed to pull Docker image"
                    );
                    return Err(err).context(format!("Failed to pull image {}", image));
                }
            }
        }
        info!(
            image = %image,
            duration_ms = start.elapsed().as_millis() as u64,
            event = "image_pull_completed",
            "Docker image pull completed"
        );
        Ok(())
    }

    async fn ensure_isolated_network(&self) -> Result<()> {
        let name = &self.config.isolated_network;
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err).context("Failed to inspect isolated network"),
        }
        let request = NetworkCreateRequest {
            name: name.clone(),
            driver: Some("bridge".to_string()),
            internal: Some(true),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        };
        match self.docker.create_network(request).await {
            Ok(_) => {
                info!(network = %name, "created isolated network");
                Ok(())
            }
            // Another start created it first.
            Err(err) if is_conflict(&err) => Ok(()),
            Err(err) => Err(err).context("Failed to create isolated network"),
        }
    }

    fn build_container(&self, spec: &InstanceSpec, image: String) -> ContainerCreateBody {
        let function = &spec.function;
        let code_path = Path::new(&function.code_path);
        let mount_target = match code_path.file_name() {
            Some(file) => format!(
                "{}/{}",
                self.config.code_mount_path,
                file.to_string_lossy()
            ),
            None => self.config.code_mount_path.clone(),
        };

        let env = runtime_environment(
            spec,
            "0.0.0.0",
            self.config.runtime_port,
            &mount_target,
            &self.config.log_level,
        )
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

        let network_mode = if function.network_access {
            "bridge".to_string()
        } else {
            self.config.isolated_network.clone()
        };

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes as i64),
            nano_cpus: Some(spec.limits.cpu_millicores as i64 * 1_000_000),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                format!("rw,noexec,nosuid,size={}", self.config.tmpfs_size),
            )])),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            network_mode: Some(network_mode),
            binds: Some(vec![format!(
                "{}:{}:ro",
                function.code_path, mount_target
            )]),
            ..Default::default()
        };

        ContainerCreateBody {
            image: Some(image),
            cmd: Some(self.config.runtime_command.clone()),
            env: Some(env),
            user: Some(self.config.user.clone()),
            labels: Some(HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (FUNCTION_LABEL.to_string(), function.name.clone()),
            ])),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn container_ip(&self, name: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;
        let networks = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .context("Container has no network settings")?;
        networks
            .into_values()
            .filter_map(|endpoint| endpoint.ip_address)
            .find(|ip| !ip.is_empty())
            .ok_or_else(|| anyhow!("Container {} has no IP address", name))
    }

    async fn running(&self, name: &str) -> Result<()> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;
        let state = inspect.state.context("Container has no state")?;
        if state.running != Some(true) {
            return Err(anyhow!(
                "container exited during start-up with code {:?}",
                state.exit_code
            ));
        }
        Ok(())
    }

    async fn kill(&self, name: &str) {
        if let Err(err) = self
            .docker
            .kill_container(
                name,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
        {
            if !is_not_found(&err) {
                debug!(container = %name, error = %err, "kill failed");
            }
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.kill(name).await;
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            // Removal already in progress from a concurrent stop.
            Err(err) if is_conflict(&err) => Ok(()),
            Err(err) => Err(err).context("Failed to remove container"),
        }
    }

    async fn remove_after_failed_start(&self, spec: &InstanceSpec, name: &str) {
        if let Err(err) = self.remove_container(name).await {
            error!(
                instance_id = %spec.instance_id,
                container = name,
                error = %format!("{err:#}"),
                "failed to clean up container after failed start"
            );
        }
    }

    async fn create_and_start(&self, spec: &InstanceSpec, name: &str) -> Result<String> {
        let image = spec
            .function
            .image
            .clone()
            .unwrap_or_else(|| self.config.base_image.clone());
        self.ensure_image(&image).await?;
        if !spec.function.network_access {
            self.ensure_isolated_network().await?;
        }

        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            platform: String::new(),
        };
        self.docker
            .create_container(Some(options), self.build_container(spec, image))
            .await
            .context("Failed to create function container")?;
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .context("Failed to start function container")?;

        let ip = self.container_ip(name).await?;
        Ok(format!("{}:{}", ip, self.config.runtime_port))
    }
}

#[async_trait]
impl RuntimeHost for ContainerHost {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Container
    }

    fn validate(&self, function: &FunctionConfig) -> Result<()> {
        if function.code_path.is_empty() {
            return Err(anyhow!("function {} has no code_path", function.name));
        }
        Ok(())
    }

    async fn start(&self, spec: &InstanceSpec) -> Result<ExecutionHandle, HostError> {
        self.validate(&spec.function).map_err(HostError::Start)?;
        let name = container_name(spec);
        let started = tokio::time::timeout(
            spec.startup_timeout,
            self.create_and_start(spec, &name),
        )
        .await;
        let address = match started {
            Ok(Ok(address)) => address,
            Ok(Err(err)) => {
                self.remove_after_failed_start(spec, &name).await;
                return Err(HostError::Start(err));
            }
            Err(_) => {
                self.remove_after_failed_start(spec, &name).await;
                return Err(HostError::StartTimeout(spec.startup_timeout));
            }
        };
        let handle = ExecutionHandle {
            instance_id: spec.instance_id.clone(),
            address,
            backend: BackendHandle::Container {
                container_id: name.clone(),
            },
        };
        info!(
            instance_id = %spec.instance_id,
            function = %spec.function.name,
            container = %name,
            address = %handle.address,
            "started container instance"
        );

        let ready = wait_until_ready(
            spec.startup_timeout,
            self.config.readiness_poll_interval,
            &format!("container {}", name),
            || self.client.health(&handle.address, HEALTH_CHECK_TIMEOUT),
            || self.running(&name),
        )
        .await;
        if let Err(err) = ready {
            if let Err(stop_err) = self.remove_container(&name).await {
                error!(
                    container = %name,
                    error = %format!("{stop_err:#}"),
                    "failed to clean up container after failed start"
                );
            }
            return Err(err);
        }
        Ok(handle)
    }

    async fn invoke(
        &self,
        handle: &ExecutionHandle,
        request: &RuntimeRequest,
        timeout: Duration,
    ) -> Result<RuntimeResponse, HostError> {
        let result = self.client.invoke(&handle.address, request, timeout).await;
        if let (Err(HostError::Timeout(_)), BackendHandle::Container { container_id }) =
            (&result, &handle.backend)
        {
            self.kill(container_id).await;
        }
        result
    }

    async fn stop(&self, handle: &ExecutionHandle) -> Result<()> {
        let BackendHandle::Container { container_id } = &handle.backend else {
            return Err(anyhow!(
                "container host cannot stop instance {}",
                handle.instance_id
            ));
        };
        self.remove_container(container_id).await?;
        info!(instance_id = %handle.instance_id, container = %container_id, "stopped container instance");
        Ok(())
    }

    async fn health_check(&self, handle: &ExecutionHandle) -> bool {
        self.client
            .health(&handle.address, HEALTH_CHECK_TIMEOUT)
            .await
            .is_ok()
    }
}
