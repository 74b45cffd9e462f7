//! In-memory runtime host for exercising pools and the execution manager
//! without processes or containers.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{ExecutionMode, InstanceId, RuntimeRequest, RuntimeResponse};
use parking_lot::Mutex;
use serde_json::json;

use crate::{
    error::HostError,
    execution_manager::ExecutionManager,
    registry::{FunctionRegistry, InMemoryFunctionRegistry},
    runtime_host::{BackendHandle, ExecutionHandle, InstanceSpec, RuntimeHost, RuntimeHosts},
    settings::OrchestratorSettings,
};

/// An execution manager over fake process-mode instances.
pub struct TestHarness {
    pub manager: Arc<ExecutionManager>,
    pub host: Arc<FakeRuntimeHost>,
}

impl TestHarness {
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self::with_hosts(settings, vec![])
    }

    pub fn with_hosts(settings: OrchestratorSettings, extra: Vec<Arc<FakeRuntimeHost>>) -> Self {
        Self::build(settings, Arc::new(InMemoryFunctionRegistry::new()), extra)
    }

    pub fn with_registry(settings: OrchestratorSettings, registry: Arc<dyn FunctionRegistry>) -> Self {
        Self::build(settings, registry, vec![])
    }

    fn build(
        settings: OrchestratorSettings,
        registry: Arc<dyn FunctionRegistry>,
        extra: Vec<Arc<FakeRuntimeHost>>,
    ) -> Self {
        let host = Arc::new(FakeRuntimeHost::new(ExecutionMode::Process));
        let mut hosts = RuntimeHosts::new().with_host(host.clone());
        for extra in extra {
            hosts = hosts.with_host(extra);
        }
        let manager = Arc::new(ExecutionManager::new(registry, hosts, settings));
        Self { manager, host }
    }

    /// Polls until `condition` holds, failing the test after five seconds.
    pub async fn wait_for(&self, condition: impl Fn(&ExecutionManager) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition(&self.manager) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    start_delay: Duration,
    stop_delay: Duration,
    failing_starts: u32,
    invoke_delay: Duration,
    handler_error: Option<(u16, String)>,
    unhealthy: HashSet<InstanceId>,
    all_unhealthy: bool,
}

pub struct FakeRuntimeHost {
    mode: ExecutionMode,
    script: Mutex<Script>,
    running: Mutex<HashSet<InstanceId>>,
    in_flight: Mutex<HashMap<InstanceId, usize>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub invocations: AtomicUsize,
    /// Highest number of concurrent invocations seen on one instance.
    pub max_overlap: AtomicUsize,
}

impl FakeRuntimeHost {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            script: Mutex::new(Script::default()),
            running: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
            max_overlap: AtomicUsize::new(0),
        }
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.script.lock().start_delay = delay;
    }

    /// The next `count` starts fail.
    pub fn fail_next_starts(&self, count: u32) {
        self.script.lock().failing_starts = count;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        self.script.lock().stop_delay = delay;
    }

    pub fn set_invoke_delay(&self, delay: Duration) {
        self.script.lock().invoke_delay = delay;
    }

    pub fn set_handler_error(&self, error: Option<(u16, &str)>) {
        self.script.lock().handler_error = error.map(|(status, msg)| (status, msg.to_string()));
    }

    pub fn set_unhealthy(&self, instance_id: &InstanceId) {
        self.script.lock().unhealthy.insert(instance_id.clone());
    }

    pub fn set_all_unhealthy(&self, unhealthy: bool) {
        self.script.lock().all_unhealthy = unhealthy;
    }

    pub fn running(&self) -> usize {
        self.running.lock().len()
    }

    fn enter(&self, id: &InstanceId) -> InFlight<'_> {
        let mut in_flight = self.in_flight.lock();
        let count = in_flight.entry(id.clone()).or_insert(0);
        *count += 1;
        self.max_overlap.fetch_max(*count, Ordering::SeqCst);
        InFlight {
            host: self,
            instance_id: id.clone(),
        }
    }
}

/// Counts one running invocation until dropped, including when the
/// invocation future is cancelled.
struct InFlight<'a> {
    host: &'a FakeRuntimeHost,
    instance_id: InstanceId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.host.in_flight.lock().get_mut(&self.instance_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl RuntimeHost for FakeRuntimeHost {
    fn mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn start(&self, spec: &InstanceSpec) -> Result<ExecutionHandle, HostError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (delay, fail) = {
            let mut script = self.script.lock();
            let fail = script.failing_starts > 0;
            if fail {
                script.failing_starts -= 1;
            }
            (script.start_delay, fail)
        };
        if delay > spec.startup_timeout {
            tokio::time::sleep(spec.startup_timeout).await;
            return Err(HostError::StartTimeout(spec.startup_timeout));
        }
        tokio::time::sleep(delay).await;
        if fail {
            return Err(HostError::Start(anyhow::anyhow!("scripted start failure")));
        }
        self.running.lock().insert(spec.instance_id.clone());
        Ok(ExecutionHandle {
            instance_id: spec.instance_id.clone(),
            address: format!("fake://{}", spec.instance_id),
            backend: match self.mode {
                ExecutionMode::Process => BackendHandle::Process {
                    pid: 0,
                    namespaces: vec![],
                    cgroup: None,
                },
                ExecutionMode::Container => BackendHandle::Container {
                    container_id: format!("faas-{}", spec.instance_id),
                },
            },
        })
    }

    async fn invoke(
        &self,
        handle: &ExecutionHandle,
        request: &RuntimeRequest,
        timeout: Duration,
    ) -> Result<RuntimeResponse, HostError> {
        if !self.running.lock().contains(&handle.instance_id) {
            return Err(HostError::Unreachable(anyhow::anyhow!(
                "instance {} is not running",
                handle.instance_id
            )));
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let (delay, handler_error) = {
            let script = self.script.lock();
            (script.invoke_delay, script.handler_error.clone())
        };

        let _in_flight = self.enter(&handle.instance_id);
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            Err(HostError::Timeout(timeout))
        } else {
            tokio::time::sleep(delay).await;
            match handler_error {
                Some((status, message)) => Err(HostError::Handler { status, message }),
                None => RuntimeResponse::from_json(&json!({
                    "instance_id": handle.instance_id.get(),
                    "method": request.method,
                    "path": request.path,
                    "body": String::from_utf8_lossy(&request.body),
                }))
                .map_err(HostError::Unreachable),
            }
        }
    }

    async fn stop(&self, handle: &ExecutionHandle) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.lock().stop_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.running.lock().remove(&handle.instance_id);
        Ok(())
    }

    async fn health_check(&self, handle: &ExecutionHandle) -> bool {
        let script = self.script.lock();
        !script.all_unhealthy &&
            !script.unhealthy.contains(&handle.instance_id) &&
            self.running.lock().contains(&handle.instance_id)
    }
}
