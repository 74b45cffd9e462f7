use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use data_model::{
    FunctionConfig,
    FunctionStats,
    InstanceId,
    InstanceSummary,
    RuntimeRequest,
    RuntimeResponse,
};
use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{CapacityReason, HostError, InvocationError},
    metrics::{function_labels, OrchestratorMetrics},
    registry::FunctionRegistry,
    resource_manager::{ResourceManager, ResourceSnapshot},
    runtime_host::{ExecutionHandle, InstanceSpec, RuntimeHosts},
    settings::OrchestratorSettings,
    worker_pool::{Acquire, Grant, Lease, Outcome, ProvisionTicket, RetireReason, WorkerPool},
};

/// Extra time granted to a host past its own start-up or invocation timeout
/// before the manager gives up on it.
const HOST_BACKSTOP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub functions: Vec<FunctionStats>,
    pub resources: ResourceSnapshot,
}

enum DispatchFailure {
    Host(HostError),
    Interrupted(RetireReason),
}

/// Entry point for invocations and the management operations around them.
pub struct ExecutionManager {
    registry: Arc<dyn FunctionRegistry>,
    hosts: RuntimeHosts,
    resources: Arc<ResourceManager>,
    settings: OrchestratorSettings,
    metrics: OrchestratorMetrics,
    pools: RwLock<HashMap<String, Arc<WorkerPool>>>,
    /// Pools of deleted functions whose instances are still draining.
    retired: Mutex<Vec<Arc<WorkerPool>>>,
}

impl ExecutionManager {
    pub fn new(
        registry: Arc<dyn FunctionRegistry>,
        hosts: RuntimeHosts,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            hosts,
            resources: Arc::new(ResourceManager::new(settings.max_concurrent_functions)),
            settings,
            metrics: OrchestratorMetrics::new(),
            pools: RwLock::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn functions(&self) -> Vec<FunctionConfig> {
        self.registry.list()
    }

    pub fn function(&self, name: &str) -> Option<FunctionConfig> {
        self.registry.get(name)
    }

    /// Pool of `name`'s current deployment, created on first use. A changed
    /// deployment drains the instances started for the previous one.
    ///
    /// Returns `None` once the function is gone from the registry. Pools are
    /// only created under the map's write lock after the registry confirmed
    /// the function, and [`Self::delete`] updates the registry before the
    /// map, so a concurrent delete never leaves a pool behind.
    fn pool_for(&self, name: &str) -> Option<Arc<WorkerPool>> {
        let existing = self.pools.read().get(name).cloned();
        let (pool, config) = match existing {
            Some(pool) => (pool, self.registry.get(name)?),
            None => {
                let mut pools = self.pools.write();
                let config = self.registry.get(name)?;
                let pool = pools
                    .entry(name.to_string())
                    .or_insert_with(|| {
                        Arc::new(WorkerPool::new(
                            config.clone(),
                            self.resources.clone(),
                            self.hosts.clone(),
                        ))
                    })
                    .clone();
                (pool, config)
            }
        };
        if *pool.config() != config {
            info!(function = %name, "deployment changed, draining previous instances");
            pool.update_config(config);
            pool.drain_all(self.settings.drain_grace_period);
        }
        Some(pool)
    }

    fn all_pools(&self) -> Vec<Arc<WorkerPool>> {
        let mut pools: Vec<_> = self.pools.read().values().cloned().collect();
        pools.extend(self.retired.lock().iter().cloned());
        pools
    }

    #[instrument(skip(self, request))]
    pub async fn invoke(
        self: &Arc<Self>,
        function: &str,
        request: RuntimeRequest,
    ) -> Result<RuntimeResponse, InvocationError> {
        let pool = self
            .pool_for(function)
            .ok_or_else(|| InvocationError::FunctionNotFound(function.to_string()))?;
        let deadline = Instant::now() + self.settings.cold_start_timeout;
        let lease = self.acquire(&pool, deadline).await?;
        self.dispatch(lease, &request).await
    }

    async fn acquire(
        self: &Arc<Self>,
        pool: &Arc<WorkerPool>,
        deadline: Instant,
    ) -> Result<Lease, InvocationError> {
        let function = pool.function();
        loop {
            let lease = match pool.acquire(self.settings.backpressure.queue_depth()) {
                Acquire::Ready(lease) => self.checked(lease).await,
                Acquire::NeedsProvisioning(ticket) => self.cold_start(ticket).await?,
                Acquire::Queued(mut waiter) => {
                    debug!(function, "waiting for a free instance");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, self.wait_for_grant(pool, &mut waiter)).await {
                        Ok(Ok(Grant::Instance(lease))) => self.checked(lease).await,
                        Ok(Ok(Grant::Provision(ticket))) => self.cold_start(ticket).await?,
                        // The pool was closed by a delete.
                        Ok(Err(_)) => {
                            return Err(InvocationError::FunctionNotFound(function.to_string()))
                        }
                        Err(_) => {
                            return Err(self.capacity_exceeded(function, CapacityReason::WaitTimedOut))
                        }
                    }
                }
                Acquire::Backpressure(reason) => return Err(self.capacity_exceeded(function, reason)),
                Acquire::Closed => {
                    return Err(InvocationError::FunctionNotFound(function.to_string()))
                }
            };
            if let Some(lease) = lease {
                return Ok(lease);
            }
            if Instant::now() >= deadline {
                return Err(self.capacity_exceeded(function, CapacityReason::WaitTimedOut));
            }
        }
    }

    /// A pool only hands out capacity when one of its own instances changes,
    /// so slots released by other functions retry the queue as well.
    async fn wait_for_grant(
        &self,
        pool: &Arc<WorkerPool>,
        waiter: &mut oneshot::Receiver<Grant>,
    ) -> Result<Grant, oneshot::error::RecvError> {
        loop {
            let released = self.resources.released();
            tokio::pin!(released);
            released.as_mut().enable();
            pool.retry_waiters();
            tokio::select! {
                grant = &mut *waiter => return grant,
                _ = released => {}
            }
        }
    }

    fn capacity_exceeded(&self, function: &str, reason: CapacityReason) -> InvocationError {
        warn!(function, reason = %reason, "capacity exceeded");
        self.metrics.admission_denials.add(
            1,
            &[
                KeyValue::new("function", function.to_string()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
        InvocationError::CapacityExceeded {
            function: function.to_string(),
            reason,
        }
    }

    /// Health-checks a warm instance before use. A failed check retires it
    /// without surfacing an error; the caller simply acquires again.
    async fn checked(&self, lease: Lease) -> Option<Lease> {
        if !self.settings.health_check_before_dispatch {
            return Some(lease);
        }
        let healthy = match self.hosts.get(lease.backend()) {
            Ok(host) => host.health_check(lease.handle()).await,
            Err(_) => false,
        };
        if healthy {
            return Some(lease);
        }
        warn!(
            function = %lease.config().name,
            instance_id = %lease.instance_id(),
            "instance failed its health check"
        );
        lease.release(Outcome::Failed(RetireReason::Unhealthy));
        None
    }

    /// Provisions on a separate task so an invocation that goes away does
    /// not abort a start half way. An instance started for nobody ends up
    /// in the ready set.
    async fn cold_start(
        self: &Arc<Self>,
        ticket: ProvisionTicket,
    ) -> Result<Option<Lease>, InvocationError> {
        let function = ticket.config().name.clone();
        let manager = self.clone();
        match tokio::spawn(async move { manager.provision(ticket, true).await }).await {
            Ok(result) => result,
            Err(err) => Err(InvocationError::ProvisioningFailure {
                function,
                message: err.to_string(),
            }),
        }
    }

    async fn provision(
        &self,
        ticket: ProvisionTicket,
        busy: bool,
    ) -> Result<Option<Lease>, InvocationError> {
        let config = ticket.config().clone();
        let instance_id = ticket.instance_id().clone();
        let started = Instant::now();
        match self.start_instance(&instance_id, &config).await {
            Ok(handle) => {
                let elapsed = started.elapsed();
                self.metrics.record_cold_start(&config.name, elapsed, true);
                info!(
                    function = %config.name,
                    instance_id = %instance_id,
                    duration_ms = elapsed.as_millis() as u64,
                    prewarm = !busy,
                    event = "cold_start_completed",
                    "instance started"
                );
                let result = if busy {
                    ticket.complete_busy(handle).map(Some)
                } else {
                    ticket.complete_ready(handle).map(|_| None)
                };
                match result {
                    Ok(lease) => Ok(lease),
                    Err(reason) => {
                        info!(
                            function = %config.name,
                            instance_id = %instance_id,
                            reason = %reason,
                            "instance retired right after start"
                        );
                        Ok(None)
                    }
                }
            }
            Err(err) => {
                let elapsed = started.elapsed();
                self.metrics.record_cold_start(&config.name, elapsed, false);
                error!(
                    function = %config.name,
                    instance_id = %instance_id,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %err,
                    event = "cold_start_failed",
                    "failed to start instance"
                );
                ticket.fail(RetireReason::ProvisioningFailed);
                Err(InvocationError::ProvisioningFailure {
                    function: config.name.clone(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Starts an instance, retrying per the provisioning policy.
    async fn start_instance(
        &self,
        instance_id: &InstanceId,
        config: &Arc<FunctionConfig>,
    ) -> Result<ExecutionHandle, HostError> {
        let limits = config.limits().map_err(HostError::Start)?;
        let policy = self.settings.provisioning;
        let mut attempt = 0;
        loop {
            let mode = policy.mode_for_attempt(config.execution_mode, attempt);
            let spec = InstanceSpec {
                instance_id: instance_id.clone(),
                function: config.clone(),
                limits,
                startup_timeout: self.settings.cold_start_timeout,
            };
            let result = match self.hosts.get(mode) {
                Ok(host) => {
                    match tokio::time::timeout(spec.startup_timeout + HOST_BACKSTOP, host.start(&spec))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(HostError::StartTimeout(spec.startup_timeout)),
                    }
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(handle) => return Ok(handle),
                Err(err) if attempt < policy.max_retries => {
                    warn!(
                        function = %config.name,
                        instance_id = %instance_id,
                        backend = %mode,
                        attempt,
                        error = %err,
                        "cold start failed, retrying"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dispatch(
        &self,
        mut lease: Lease,
        request: &RuntimeRequest,
    ) -> Result<RuntimeResponse, InvocationError> {
        let config = lease.config().clone();
        let function = config.name.clone();
        let instance_id = lease.instance_id().clone();
        let host = match self.hosts.get(lease.backend()) {
            Ok(host) => host,
            Err(err) => {
                lease.release(Outcome::Failed(RetireReason::Crashed));
                return Err(InvocationError::BackendUnhealthy {
                    function,
                    instance_id,
                    message: err.to_string(),
                });
            }
        };

        lease.mark_dispatched();
        let interrupted = lease.interrupted();
        let started = Instant::now();
        let result = tokio::select! {
            result = host.invoke(lease.handle(), request, config.timeout) => {
                result.map_err(DispatchFailure::Host)
            }
            _ = tokio::time::sleep(config.timeout + HOST_BACKSTOP) => {
                Err(DispatchFailure::Host(HostError::Timeout(config.timeout)))
            }
            reason = interrupted => Err(DispatchFailure::Interrupted(reason)),
        };
        let elapsed = started.elapsed();

        let labels = function_labels(&function);
        self.metrics.invocations.add(1, &labels);
        self.metrics
            .invocation_latency
            .record(elapsed.as_secs_f64(), &labels);

        let (outcome, result) = match result {
            Ok(response) => (Outcome::Success, Ok(response)),
            Err(DispatchFailure::Host(HostError::Handler { status, message })) => (
                Outcome::HandlerFailed,
                Err(InvocationError::HandlerError {
                    function: function.clone(),
                    status,
                    message,
                }),
            ),
            Err(DispatchFailure::Host(HostError::Timeout(timeout))) => (
                Outcome::Failed(RetireReason::Timeout),
                Err(InvocationError::InvocationTimeout {
                    function: function.clone(),
                    timeout,
                }),
            ),
            Err(DispatchFailure::Interrupted(RetireReason::Drained)) => (
                Outcome::Failed(RetireReason::Timeout),
                Err(InvocationError::InvocationTimeout {
                    function: function.clone(),
                    timeout: elapsed,
                }),
            ),
            Err(DispatchFailure::Interrupted(reason)) => (
                Outcome::Failed(RetireReason::Crashed),
                Err(InvocationError::BackendUnhealthy {
                    function: function.clone(),
                    instance_id: instance_id.clone(),
                    message: format!("instance retired during invocation: {}", reason),
                }),
            ),
            Err(DispatchFailure::Host(err)) => (
                Outcome::Failed(RetireReason::Crashed),
                Err(InvocationError::BackendUnhealthy {
                    function: function.clone(),
                    instance_id: instance_id.clone(),
                    message: err.to_string(),
                }),
            ),
        };

        match &result {
            Ok(_) => debug!(
                function = %function,
                instance_id = %instance_id,
                duration_ms = elapsed.as_millis() as u64,
                "invocation completed"
            ),
            Err(err) => {
                self.metrics.invocation_errors.add(1, &labels);
                if matches!(err, InvocationError::InvocationTimeout { .. }) {
                    self.metrics.invocation_timeouts.add(1, &labels);
                }
                warn!(
                    function = %function,
                    instance_id = %instance_id,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "invocation failed"
                );
            }
        }
        lease.release(outcome);
        result
    }

    /// Validates and stores a deployment, drains instances of the previous
    /// one and pre-warms `min_instances`.
    pub fn deploy(self: &Arc<Self>, config: FunctionConfig) -> Result<()> {
        config.validate()?;
        let host = self
            .hosts
            .get(config.execution_mode)
            .with_context(|| format!("cannot deploy function {}", config.name))?;
        host.validate(&config)?;

        let previous = self.registry.put(config.clone());
        info!(
            function = %config.name,
            backend = %config.execution_mode,
            min_instances = config.min_instances,
            max_instances = config.max_instances,
            replaced = previous.is_some(),
            "function deployed"
        );
        // A delete racing this deploy leaves nothing to pre-warm.
        if let Some(pool) = self.pool_for(&config.name) {
            self.prewarm(&pool);
        }
        Ok(())
    }

    /// Removes a function. Queued invocations fail, running ones get the
    /// drain grace period.
    pub fn delete(&self, name: &str) -> Result<FunctionConfig, InvocationError> {
        let removed = self.registry.remove(name);
        let pool = self.pools.write().remove(name);
        if let Some(pool) = pool {
            pool.close();
            pool.drain_all(self.settings.drain_grace_period);
            self.retired.lock().push(pool);
        }
        let removed = removed.ok_or_else(|| InvocationError::FunctionNotFound(name.to_string()))?;
        info!(function = %name, "function deleted");
        Ok(removed)
    }

    fn prewarm(self: &Arc<Self>, pool: &Arc<WorkerPool>) {
        for _ in 0..pool.deficit() {
            let Some(ticket) = pool.reserve_prewarm() else {
                break;
            };
            debug!(function = %pool.function(), instance_id = %ticket.instance_id(), "pre-warming instance");
            let manager = self.clone();
            tokio::spawn(async move {
                // Failures are already logged and counted.
                let _ = manager.provision(ticket, false).await;
            });
        }
    }

    pub fn list_instances(&self) -> Vec<InstanceSummary> {
        let now = Instant::now();
        let mut instances: Vec<InstanceSummary> = self
            .all_pools()
            .iter()
            .flat_map(|pool| pool.summaries(now))
            .collect();
        instances.sort_by(|a, b| a.function.cmp(&b.function).then(b.age_ms.cmp(&a.age_ms)));
        instances
    }

    pub fn stats(&self, name: &str) -> Result<FunctionStats, InvocationError> {
        if let Some(pool) = self.pools.read().get(name) {
            return Ok(pool.stats());
        }
        if self.registry.get(name).is_some() {
            return Ok(FunctionStats {
                function: name.to_string(),
                ..Default::default()
            });
        }
        Err(InvocationError::FunctionNotFound(name.to_string()))
    }

    /// Forces an instance to `Draining`. Returns `false` for unknown or
    /// already terminated instances.
    pub fn stop_instance(&self, id: &InstanceId) -> bool {
        let stopped = self.all_pools().iter().any(|pool| pool.stop_instance(id));
        if stopped {
            info!(instance_id = %id, "instance stop requested");
        }
        stopped
    }

    pub fn overview(&self) -> Overview {
        let mut functions: Vec<FunctionStats> = self
            .registry
            .list()
            .iter()
            .map(|config| {
                self.stats(&config.name).unwrap_or_else(|_| FunctionStats {
                    function: config.name.clone(),
                    ..Default::default()
                })
            })
            .collect();
        functions.sort_by(|a, b| a.function.cmp(&b.function));
        Overview {
            functions,
            resources: self.resources.snapshot(),
        }
    }

    pub fn check_invariants(&self) -> Result<()> {
        self.resources.check_invariants()?;
        for pool in self.all_pools() {
            pool.check_invariants()?;
        }
        Ok(())
    }

    /// One pass of the TTL sweeper: evicts idle instances, tops pools back
    /// up to `min_instances`, forgets fully drained deleted pools and checks
    /// the resource invariants. Returns the number of evictions.
    pub fn sweep_once(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let pools: Vec<_> = self.pools.read().values().cloned().collect();
        let mut evicted = 0;
        for pool in &pools {
            let count = pool.sweep(now, self.settings.warm_instance_ttl);
            if count > 0 {
                self.metrics
                    .evictions
                    .add(count as u64, &function_labels(pool.function()));
                info!(function = %pool.function(), evicted = count, "evicted idle instances");
            }
            evicted += count;
            self.prewarm(pool);
        }
        self.retired.lock().retain(|pool| !pool.is_empty());
        if let Err(err) = self.check_invariants() {
            error!(error = %format!("{err:#}"), "orchestrator invariant violated");
        }
        evicted
    }

    /// Drains every pool and waits for the instances to terminate.
    pub async fn shutdown(&self) {
        let pools = self.all_pools();
        info!(pools = pools.len(), "draining all pools");
        for pool in &pools {
            pool.close();
            pool.drain_all(self.settings.drain_grace_period);
        }
        let drained = futures::future::join_all(pools.iter().map(|pool| pool.wait_until_drained()));
        let limit = self.settings.drain_grace_period + self.settings.cold_start_timeout;
        if tokio::time::timeout(limit, drained).await.is_err() {
            warn!("instances still draining at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
        Weak,
    };

    use data_model::{
        test_objects::tests::{
            mock_function_config,
            mock_function_config_with_timeout,
            mock_request,
        },
        ExecutionMode,
    };

    use super::*;
    use crate::{
        registry::InMemoryFunctionRegistry,
        settings::ProvisioningPolicy,
        testing::{FakeRuntimeHost, TestHarness},
    };

    /// Deletes the looked up function through the manager right after the
    /// next lookup returns, the way a concurrent delete can land there.
    #[derive(Default)]
    struct DeleteAfterLookup {
        inner: InMemoryFunctionRegistry,
        armed: AtomicBool,
        manager: OnceLock<Weak<ExecutionManager>>,
    }

    impl FunctionRegistry for DeleteAfterLookup {
        fn get(&self, name: &str) -> Option<FunctionConfig> {
            let found = self.inner.get(name);
            if self.armed.swap(false, Ordering::SeqCst) {
                if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
                    manager.delete(name).unwrap();
                }
            }
            found
        }

        fn put(&self, config: FunctionConfig) -> Option<FunctionConfig> {
            self.inner.put(config)
        }

        fn remove(&self, name: &str) -> Option<FunctionConfig> {
            self.inner.remove(name)
        }

        fn list(&self) -> Vec<FunctionConfig> {
            self.inner.list()
        }
    }

    fn instance_of(t: &TestHarness, function: &str) -> InstanceId {
        t.manager
            .list_instances()
            .into_iter()
            .find(|instance| instance.function == function)
            .map(|instance| instance.id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_warm_path_reuses_instance() -> anyhow::Result<()> {
        let t = TestHarness::new(OrchestratorSettings::default());
        t.manager.deploy(mock_function_config("f", 0, 3))?;

        let first: serde_json::Value = t.manager.invoke("f", mock_request("1")).await?.json()?;
        let second: serde_json::Value = t.manager.invoke("f", mock_request("2")).await?.json()?;
        assert_eq!(first["instance_id"], second["instance_id"]);
        assert_eq!(second["body"], "2");
        assert_eq!(t.host.starts.load(Ordering::SeqCst), 1);

        let stats = t.manager.stats("f")?;
        assert_eq!((stats.ready_count, stats.cold_starts, stats.invocations), (1, 1, 2));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let t = TestHarness::new(OrchestratorSettings::default());
        let err = t.manager.invoke("nope", mock_request("")).await.unwrap_err();
        assert!(matches!(err, InvocationError::FunctionNotFound(_)));
        assert!(t.manager.stats("nope").is_err());
        assert!(t.manager.delete("nope").is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_instance_is_replaced_silently() -> anyhow::Result<()> {
        let t = TestHarness::new(OrchestratorSettings::default());
        t.manager.deploy(mock_function_config("f", 0, 2))?;
        let first: serde_json::Value = t.manager.invoke("f", mock_request("")).await?.json()?;
        let first_id = InstanceId::from(first["instance_id"].as_str().unwrap_or_default());
        t.host.set_unhealthy(&first_id);

        let second: serde_json::Value = t.manager.invoke("f", mock_request("")).await?.json()?;
        assert_ne!(first["instance_id"], second["instance_id"]);
        assert_eq!(t.host.starts.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_not_retried_by_default() -> anyhow::Result<()> {
        let t = TestHarness::new(OrchestratorSettings::default());
        t.manager.deploy(mock_function_config("f", 0, 1))?;
        t.host.fail_next_starts(1);

        let err = t.manager.invoke("f", mock_request("")).await.unwrap_err();
        assert!(matches!(err, InvocationError::ProvisioningFailure { .. }));
        assert_eq!(t.host.starts.load(Ordering::SeqCst), 1);
        assert_eq!(t.manager.stats("f")?.cold_start_failures, 1);
        assert_eq!(t.manager.resources().active(), 0);

        // Nothing is left behind, the next call provisions again.
        t.manager.invoke("f", mock_request("")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_with_fallback_backend() -> anyhow::Result<()> {
        let settings = OrchestratorSettings {
            provisioning: ProvisioningPolicy {
                max_retries: 1,
                fallback_mode: Some(ExecutionMode::Container),
            },
            ..Default::default()
        };
        let container = Arc::new(FakeRuntimeHost::new(ExecutionMode::Container));
        let t = TestHarness::with_hosts(settings, vec![container.clone()]);
        t.manager.deploy(mock_function_config("f", 0, 1))?;
        t.host.fail_next_starts(1);

        t.manager.invoke("f", mock_request("")).await?;
        assert_eq!(t.host.starts.load(Ordering::SeqCst), 1);
        assert_eq!(container.starts.load(Ordering::SeqCst), 1);
        assert_eq!(container.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(t.manager.list_instances()[0].backend, ExecutionMode::Container);
        Ok(())
    }

    #[tokio::test]
    async fn test_handler_error_keeps_instance() -> anyhow::Result<()> {
        let t = TestHarness::new(OrchestratorSettings::default());
        t.manager.deploy(mock_function_config("f", 0, 1))?;
        t.host.set_handler_error(Some((422, "bad input")));

        match t.manager.invoke("f", mock_request("")).await {
            Err(InvocationError::HandlerError { status, message, .. }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let stats = t.manager.stats("f")?;
        assert_eq!((stats.ready_count, stats.errors), (1, 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_deploy_rejects_missing_backend() {
        let t = TestHarness::new(OrchestratorSettings::default());
        let mut config = mock_function_config("f", 0, 1);
        config.execution_mode = ExecutionMode::Container;
        assert!(t.manager.deploy(config).is_err());
        assert!(t.manager.function("f").is_none());
    }

    #[tokio::test]
    async fn test_prewarm_and_replenish() -> anyhow::Result<()> {
        let t = TestHarness::new(OrchestratorSettings::default());
        t.manager.deploy(mock_function_config("f", 2, 4))?;
        t.wait_for(|m| m.stats("f").map(|s| s.ready_count).unwrap_or(0) == 2)
            .await;

        let victim = t.manager.list_instances()[0].id.clone();
        assert!(t.manager.stop_instance(&victim));
        assert_eq!(t.manager.stats("f")?.ready_count, 1);

        t.manager.sweep_once();
        t.wait_for(|m| m.stats("f").map(|s| s.ready_count).unwrap_or(0) == 2)
            .await;
        assert_eq!(t.host.starts.load(Ordering::SeqCst), 3);
        t.manager.check_invariants()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_redeploy_drains_previous_generation() -> anyhow::Result<()> {
        let t = TestHarness::new(OrchestratorSettings::default());
        t.manager.deploy(mock_function_config("f", 0, 2))?;
        let before: serde_json::Value = t.manager.invoke("f", mock_request("")).await?.json()?;

        let mut updated = mock_function_config("f", 0, 2);
        updated.environment.insert("VERSION".to_string(), "2".to_string());
        t.manager.deploy(updated)?;

        let after: serde_json::Value = t.manager.invoke("f", mock_request("")).await?.json()?;
        assert_ne!(before["instance_id"], after["instance_id"]);
        t.wait_for(|m| m.list_instances().len() == 1).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_during_invoke_leaves_no_pool() -> anyhow::Result<()> {
        let registry = Arc::new(DeleteAfterLookup::default());
        let t = TestHarness::with_registry(OrchestratorSettings::default(), registry.clone());
        registry.manager.set(Arc::downgrade(&t.manager)).unwrap();
        t.manager.deploy(mock_function_config("f", 1, 2))?;
        t.wait_for(|m| m.stats("f").map(|s| s.ready_count).unwrap_or(0) == 1)
            .await;

        registry.armed.store(true, Ordering::SeqCst);
        let err = t.manager.invoke("f", mock_request("")).await.unwrap_err();
        assert!(matches!(err, InvocationError::FunctionNotFound(_)), "{err:?}");
        assert!(t.manager.function("f").is_none());

        let host = t.host.clone();
        t.wait_for(move |m| m.list_instances().is_empty() && host.running() == 0)
            .await;
        for _ in 0..3 {
            t.manager.sweep_once();
            tokio::task::yield_now().await;
        }
        assert!(t.manager.pools.read().is_empty());
        assert!(t.manager.list_instances().is_empty());
        assert!(matches!(
            t.manager.stats("f"),
            Err(InvocationError::FunctionNotFound(_))
        ));
        assert_eq!(t.manager.resources().active(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_after_delete_creates_no_pool() -> anyhow::Result<()> {
        let t = TestHarness::new(OrchestratorSettings::default());
        t.manager.deploy(mock_function_config("f", 0, 1))?;
        t.manager.delete("f")?;
        assert!(t.manager.pool_for("f").is_none());
        assert!(t.manager.pools.read().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_freed_by_another_function_serves_queue() -> anyhow::Result<()> {
        let settings = OrchestratorSettings {
            max_concurrent_functions: 2,
            cold_start_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let container = Arc::new(FakeRuntimeHost::new(ExecutionMode::Container));
        let t = TestHarness::with_hosts(settings, vec![container]);
        let mut g = mock_function_config("g", 1, 1);
        g.execution_mode = ExecutionMode::Container;
        t.manager.deploy(g)?;
        t.wait_for(|m| m.stats("g").map(|s| s.ready_count).unwrap_or(0) == 1)
            .await;

        t.manager
            .deploy(mock_function_config_with_timeout("f", Duration::from_secs(60)))?;
        t.host.set_invoke_delay(Duration::from_secs(20));
        t.host.set_stop_delay(Duration::from_secs(120));
        let manager = t.manager.clone();
        let first = tokio::spawn(async move { manager.invoke("f", mock_request("1")).await });
        t.wait_for(|m| m.stats("f").map(|s| s.busy_count).unwrap_or(0) == 1)
            .await;
        let manager = t.manager.clone();
        let second = tokio::spawn(async move { manager.invoke("f", mock_request("2")).await });
        t.wait_for(|m| m.stats("f").map(|s| s.queued).unwrap_or(0) == 1)
            .await;

        // f's instance keeps its slot while it drains, g holds the other one.
        assert!(t.manager.stop_instance(&instance_of(&t, "f")));
        assert!(first.await?.is_err());
        assert_eq!(t.manager.stats("f")?.queued, 1);

        t.host.set_invoke_delay(Duration::from_secs(1));
        let released_at = Instant::now();
        assert!(t.manager.stop_instance(&instance_of(&t, "g")));

        let response: serde_json::Value = second.await??.json()?;
        assert_eq!(response["body"], "2");
        assert!(released_at.elapsed() < Duration::from_secs(10));
        assert_eq!(t.manager.stats("f")?.draining_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_all_warm_instances_unhealthy_falls_back_to_cold_start() -> anyhow::Result<()> {
        let t = TestHarness::new(OrchestratorSettings::default());
        t.manager.deploy(mock_function_config("f", 2, 3))?;
        t.wait_for(|m| m.stats("f").map(|s| s.ready_count).unwrap_or(0) == 2)
            .await;
        let warm: Vec<String> = t
            .manager
            .list_instances()
            .into_iter()
            .map(|instance| instance.id.to_string())
            .collect();

        t.host.set_all_unhealthy(true);
        let response: serde_json::Value = t.manager.invoke("f", mock_request("")).await?.json()?;
        assert!(!warm.iter().any(|id| response["instance_id"] == id.as_str()));
        assert_eq!(t.host.starts.load(Ordering::SeqCst), 3);

        t.host.set_all_unhealthy(false);
        let host = t.host.clone();
        t.wait_for(move |_| host.running() == 1).await;
        assert_eq!(t.manager.stats("f")?.ready_count, 1);
        t.manager.check_invariants()?;
        Ok(())
    }
}
