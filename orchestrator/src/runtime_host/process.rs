use std::{
    collections::HashMap,
    fs::File,
    net::TcpListener,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use data_model::{
    duration_secs,
    ExecutionMode,
    FunctionConfig,
    InstanceId,
    RuntimeRequest,
    RuntimeResponse,
};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::{
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{error, info, warn};

use super::{
    client::RuntimeClient,
    readiness::wait_until_ready,
    runtime_environment,
    sandbox::{self, Cgroup, Isolation, SyscallFilter},
    BackendHandle,
    ExecutionHandle,
    InstanceSpec,
    Namespace,
    RuntimeHost,
};
use crate::error::HostError;

const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/faas";
const DEFAULT_READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);
const LOOPBACK: &str = "127.0.0.1";

fn default_runtime_command() -> Vec<String> {
    vec![
        "python3".to_string(),
        "-m".to_string(),
        "faas.runtime_host".to_string(),
    ]
}

fn default_namespaces() -> Vec<Namespace> {
    vec![Namespace::Pid, Namespace::Mount, Namespace::User]
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessHostConfig {
    /// Program and arguments of the in-instance runtime.
    #[serde_inline_default(default_runtime_command())]
    pub runtime_command: Vec<String>,
    /// Namespaces every process instance is moved into.
    #[serde_inline_default(default_namespaces())]
    pub namespaces: Vec<Namespace>,
    /// Parent cgroup for instance leaves. `None` disables cgroup limits.
    #[serde_inline_default(Some(PathBuf::from(DEFAULT_CGROUP_ROOT)))]
    pub cgroup_root: Option<PathBuf>,
    #[serde_inline_default(true)]
    pub drop_capabilities: bool,
    #[serde_inline_default(true)]
    pub syscall_filter: bool,
    #[serde_inline_default(DEFAULT_READINESS_POLL_INTERVAL)]
    #[serde(with = "duration_secs")]
    pub readiness_poll_interval: Duration,
    #[serde_inline_default("info".to_string())]
    pub log_level: String,
}

impl Default for ProcessHostConfig {
    fn default() -> Self {
        Self {
            runtime_command: default_runtime_command(),
            namespaces: default_namespaces(),
            cgroup_root: Some(PathBuf::from(DEFAULT_CGROUP_ROOT)),
            drop_capabilities: true,
            syscall_filter: true,
            readiness_poll_interval: DEFAULT_READINESS_POLL_INTERVAL,
            log_level: "info".to_string(),
        }
    }
}

/// Runs each instance as a sandboxed child process reached over loopback.
pub struct ProcessHost {
    config: ProcessHostConfig,
    client: RuntimeClient,
    children: Arc<Mutex<HashMap<InstanceId, Child>>>,
}

impl ProcessHost {
    pub fn new(config: ProcessHostConfig) -> Result<Self> {
        if config.runtime_command.is_empty() {
            return Err(anyhow!("process host runtime_command must not be empty"));
        }
        if config.namespaces.contains(&Namespace::Network) {
            return Err(anyhow!(
                "process instances are reached over loopback and cannot use a network namespace"
            ));
        }
        if let Some(root) = &config.cgroup_root {
            if let Err(err) = sandbox::enable_controllers(root) {
                warn!(
                    cgroup_root = %root.display(),
                    error = %err,
                    event = "cgroup_unavailable",
                    "cgroup limits will not be applied to process instances"
                );
            }
        }
        Ok(Self {
            config,
            client: RuntimeClient::new()?,
            children: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn build_command(
        &self,
        spec: &InstanceSpec,
        port: u16,
        isolation: Isolation,
    ) -> Command {
        let program = &self.config.runtime_command[0];
        let mut cmd = Command::new(program);
        cmd.args(&self.config.runtime_command[1..]);
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.envs(runtime_environment(
            spec,
            LOOPBACK,
            port,
            &spec.function.code_path,
            &self.config.log_level,
        ));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        // SAFETY: `Isolation::apply` only issues async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || isolation.apply());
        }
        cmd
    }

    fn create_cgroup(&self, spec: &InstanceSpec) -> Option<Cgroup> {
        let root = self.config.cgroup_root.as_ref()?;
        match Cgroup::create(root, &spec.instance_id, &spec.limits) {
            Ok(cgroup) => Some(cgroup),
            Err(err) => {
                warn!(
                    instance_id = %spec.instance_id,
                    error = %format!("{err:#}"),
                    event = "cgroup_unavailable",
                    "starting process instance without cgroup limits"
                );
                None
            }
        }
    }

    fn isolation(&self, cgroup_procs: Option<File>) -> Isolation {
        let filter = if self.config.syscall_filter {
            SyscallFilter::deny_privileged()
        } else {
            None
        };
        Isolation {
            namespaces: sandbox::clone_flags(&self.config.namespaces),
            cgroup_procs,
            drop_capabilities: self.config.drop_capabilities,
            filter,
        }
    }

    /// Kills the whole process group immediately.
    fn kill_group(pid: u32) {
        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            if err != nix::errno::Errno::ESRCH {
                warn!(pid, error = %err, "failed to kill process group");
            }
        }
    }

    async fn still_running(&self, instance_id: &InstanceId) -> Result<()> {
        let mut children = self.children.lock().await;
        let child = children
            .get_mut(instance_id)
            .context("runtime process is no longer tracked")?;
        if let Some(status) = child.try_wait()? {
            return Err(anyhow!("runtime exited during start-up with {}", status));
        }
        Ok(())
    }
}

fn remove_cgroup_after_failed_start(spec: &InstanceSpec, cgroup: Option<&Cgroup>) {
    let Some(cgroup) = cgroup else {
        return;
    };
    if let Err(err) = Cgroup::remove(cgroup.path()) {
        error!(
            instance_id = %spec.instance_id,
            cgroup = %cgroup.path().display(),
            error = %format!("{err:#}"),
            "failed to remove cgroup after failed start"
        );
    }
}

/// Binds port 0 to let the kernel pick a free port, then releases it for the
/// runtime to bind.
fn allocate_ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind((LOOPBACK, 0)).context("binding an ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl RuntimeHost for ProcessHost {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Process
    }

    fn validate(&self, function: &FunctionConfig) -> Result<()> {
        if !function.network_access {
            return Err(anyhow!(
                "function {} disables network access, which process instances cannot honor; use container mode",
                function.name
            ));
        }
        if function.code_path.is_empty() {
            return Err(anyhow!("function {} has no code_path", function.name));
        }
        Ok(())
    }

    async fn start(&self, spec: &InstanceSpec) -> Result<ExecutionHandle, HostError> {
        let function = &spec.function;
        self.validate(function).map_err(HostError::Start)?;

        let port = allocate_ephemeral_port().map_err(HostError::Start)?;
        let cgroup = self.create_cgroup(spec);
        let cgroup_procs = match cgroup.as_ref().map(Cgroup::procs_file).transpose() {
            Ok(file) => file,
            Err(err) => {
                remove_cgroup_after_failed_start(spec, cgroup.as_ref());
                return Err(HostError::Start(err));
            }
        };

        let mut cmd = self.build_command(spec, port, self.isolation(cgroup_procs));
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                remove_cgroup_after_failed_start(spec, cgroup.as_ref());
                return Err(HostError::Start(anyhow!(err).context(format!(
                    "spawning runtime {:?}",
                    self.config.runtime_command
                ))));
            }
        };
        let pid = child.id().unwrap_or_default();
        let handle = ExecutionHandle {
            instance_id: spec.instance_id.clone(),
            address: format!("{}:{}", LOOPBACK, port),
            backend: BackendHandle::Process {
                pid,
                namespaces: self.config.namespaces.clone(),
                cgroup: cgroup.as_ref().map(|c| c.path().to_path_buf()),
            },
        };
        self.children
            .lock()
            .await
            .insert(spec.instance_id.clone(), child);

        info!(
            instance_id = %spec.instance_id,
            function = %function.name,
            pid,
            address = %handle.address,
            "started process instance"
        );

        let ready = wait_until_ready(
            spec.startup_timeout,
            self.config.readiness_poll_interval,
            &format!("process instance {}", spec.instance_id),
            || self.client.health(&handle.address, HEALTH_CHECK_TIMEOUT),
            || self.still_running(&spec.instance_id),
        )
        .await;
        if let Err(err) = ready {
            if let Err(stop_err) = self.stop(&handle).await {
                error!(
                    instance_id = %spec.instance_id,
                    error = %format!("{stop_err:#}"),
                    "failed to clean up process instance after failed start"
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
        if let (Err(HostError::Timeout(_)), BackendHandle::Process { pid, .. }) =
            (&result, &handle.backend)
        {
            Self::kill_group(*pid);
        }
        result
    }

    async fn stop(&self, handle: &ExecutionHandle) -> Result<()> {
        let BackendHandle::Process { pid, cgroup, .. } = &handle.backend else {
            return Err(anyhow!(
                "process host cannot stop instance {}",
                handle.instance_id
            ));
        };
        let child = self.children.lock().await.remove(&handle.instance_id);
        if let Some(mut child) = child {
            let group = Pid::from_raw(*pid as i32);
            if let Err(err) = killpg(group, Signal::SIGTERM) {
                if err != nix::errno::Errno::ESRCH {
                    warn!(pid, error = %err, "failed to signal process group");
                }
            }
            match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
                Ok(status) => {
                    status.context("waiting for runtime process")?;
                }
                Err(_) => {
                    warn!(
                        instance_id = %handle.instance_id,
                        pid,
                        "runtime ignored SIGTERM, killing"
                    );
                    Self::kill_group(*pid);
                    child.wait().await.context("waiting for killed runtime")?;
                }
            }
            info!(instance_id = %handle.instance_id, pid, "stopped process instance");
        }
        if let Some(path) = cgroup {
            Cgroup::remove(path)?;
        }
        Ok(())
    }

    async fn health_check(&self, handle: &ExecutionHandle) -> bool {
        if self.still_running(&handle.instance_id).await.is_err() {
            return false;
        }
        self.client
            .health(&handle.address, HEALTH_CHECK_TIMEOUT)
            .await
            .is_ok()
    }
}
