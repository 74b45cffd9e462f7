use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use data_model::{
    ExecutionMode,
    FunctionConfig,
    InstanceId,
    ResourceLimits,
    RuntimeRequest,
    RuntimeResponse,
};
use serde::{Deserialize, Serialize};

use crate::error::HostError;

pub mod client;
pub mod container;
pub mod process;
mod readiness;
mod sandbox;

pub use container::{ContainerHost, ContainerHostConfig};
pub use process::{ProcessHost, ProcessHostConfig};

/// What a host needs to start one instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub instance_id: InstanceId,
    pub function: Arc<FunctionConfig>,
    pub limits: ResourceLimits,
    /// Bound on start-up including code load.
    pub startup_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Pid,
    Mount,
    User,
    Ipc,
    Uts,
    Network,
}

/// Backend-specific part of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendHandle {
    Process {
        pid: u32,
        namespaces: Vec<Namespace>,
        cgroup: Option<PathBuf>,
    },
    Container {
        container_id: String,
    },
}

impl BackendHandle {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            BackendHandle::Process { .. } => ExecutionMode::Process,
            BackendHandle::Container { .. } => ExecutionMode::Container,
        }
    }
}

/// Handle to a started instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    pub instance_id: InstanceId,
    /// `host:port` the in-instance runtime listens on.
    pub address: String,
    pub backend: BackendHandle,
}

/// Unified contract over process and container isolation.
#[async_trait]
pub trait RuntimeHost: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Rejects deployments this host cannot run, before any instance starts.
    fn validate(&self, _function: &FunctionConfig) -> anyhow::Result<()> {
        Ok(())
    }

    /// Starts an instance and returns once its handler is resolvable. A
    /// failed or timed out start leaves nothing behind.
    async fn start(&self, spec: &InstanceSpec) -> Result<ExecutionHandle, HostError>;

    /// Forwards one request. On timeout the in-flight execution is killed.
    async fn invoke(
        &self,
        handle: &ExecutionHandle,
        request: &RuntimeRequest,
        timeout: Duration,
    ) -> Result<RuntimeResponse, HostError>;

    /// Tears the instance down. Stopping an instance twice is a no-op.
    async fn stop(&self, handle: &ExecutionHandle) -> anyhow::Result<()>;

    async fn health_check(&self, handle: &ExecutionHandle) -> bool;
}

/// Hosts by execution mode.
#[derive(Clone, Default)]
pub struct RuntimeHosts {
    hosts: HashMap<ExecutionMode, Arc<dyn RuntimeHost>>,
}

impl RuntimeHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: Arc<dyn RuntimeHost>) -> Self {
        self.hosts.insert(host.mode(), host);
        self
    }

    pub fn get(&self, mode: ExecutionMode) -> Result<Arc<dyn RuntimeHost>, HostError> {
        self.hosts
            .get(&mode)
            .cloned()
            .ok_or(HostError::NoBackend(mode))
    }

    pub fn modes(&self) -> Vec<ExecutionMode> {
        self.hosts.keys().copied().collect()
    }
}

/// Environment the in-instance runtime reads on start-up, followed by the
/// function's own variables.
pub(crate) fn runtime_environment(
    spec: &InstanceSpec,
    bind_host: &str,
    port: u16,
    function_path: &str,
    log_level: &str,
) -> Vec<(String, String)> {
    let function = &spec.function;
    let mut env = vec![
        ("RUNTIME_HOST".to_string(), bind_host.to_string()),
        ("RUNTIME_PORT".to_string(), port.to_string()),
        ("RUNTIME_ID".to_string(), spec.instance_id.to_string()),
        ("FUNCTION_PATH".to_string(), function_path.to_string()),
        ("FUNCTION_NAME".to_string(), function.handler.clone()),
        (
            "FUNCTION_TIMEOUT".to_string(),
            function.timeout.as_secs_f64().to_string(),
        ),
        (
            "EXECUTION_MODE".to_string(),
            function.execution_mode.to_string(),
        ),
        (
            "MEMORY_LIMIT".to_string(),
            spec.limits.memory_bytes.to_string(),
        ),
        (
            "CPU_LIMIT".to_string(),
            format!("{}m", spec.limits.cpu_millicores),
        ),
        ("LOG_LEVEL".to_string(), log_level.to_uppercase()),
    ];
    env.extend(
        function
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    env
}
