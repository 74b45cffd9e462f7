use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::pending,
    sync::Arc,
    time::Duration,
};

use data_model::{
    ExecutionMode,
    FunctionConfig,
    FunctionStats,
    InstanceId,
    InstanceState,
    InstanceSummary,
};
use parking_lot::Mutex;
use strum::AsRefStr;
use tokio::{
    sync::{oneshot, Notify},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::CapacityReason,
    instance::Instance,
    resource_manager::{AdmissionDenied, ResourceManager},
    runtime_host::{ExecutionHandle, RuntimeHosts},
};

/// Why an instance leaves service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum RetireReason {
    IdleExpired,
    Timeout,
    Crashed,
    Unhealthy,
    ProvisioningFailed,
    Stopped,
    Drained,
    /// The invocation holding the instance went away mid-request.
    Abandoned,
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// How a dispatch ended, reported through [`Lease::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The handler returned an error; the instance itself is fine.
    HandlerFailed,
    /// Never dispatched.
    Unused,
    Failed(RetireReason),
}

/// Result of [`WorkerPool::acquire`].
pub enum Acquire {
    Ready(Lease),
    NeedsProvisioning(ProvisionTicket),
    Queued(oneshot::Receiver<Grant>),
    Backpressure(CapacityReason),
    Closed,
}

/// What a queued invocation is handed once capacity frees up.
pub enum Grant {
    Instance(Lease),
    Provision(ProvisionTicket),
}

#[derive(Debug, Default)]
struct Counters {
    cold_starts: u64,
    cold_start_failures: u64,
    invocations: u64,
    errors: u64,
    timeouts: u64,
    evictions: u64,
}

struct PoolState {
    config: Arc<FunctionConfig>,
    /// Bumped by every drain; instances of older generations never return
    /// to the ready set.
    generation: u64,
    instances: HashMap<InstanceId, Instance>,
    /// Ready instances, least recently used first.
    ready: VecDeque<InstanceId>,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    /// Interrupts the invocation running on a busy instance.
    interrupts: HashMap<InstanceId, oneshot::Sender<RetireReason>>,
    closed: bool,
    counters: Counters,
}

impl PoolState {
    fn live_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.state().is_active())
            .count()
    }

    fn count(&self, state: InstanceState) -> usize {
        self.instances
            .values()
            .filter(|i| i.state() == state)
            .count()
    }

    fn queued(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }
}

/// Ready and busy instances of one function.
///
/// All bookkeeping happens under one short-lived lock; starting, invoking
/// and stopping backends happens outside of it. Leases and tickets hold an
/// `Arc` to the pool and must never be dropped while the lock is held.
pub struct WorkerPool {
    function: String,
    resources: Arc<ResourceManager>,
    hosts: RuntimeHosts,
    state: Mutex<PoolState>,
    changed: Notify,
}

impl WorkerPool {
    pub fn new(config: FunctionConfig, resources: Arc<ResourceManager>, hosts: RuntimeHosts) -> Self {
        Self {
            function: config.name.clone(),
            resources,
            hosts,
            state: Mutex::new(PoolState {
                config: Arc::new(config),
                generation: 0,
                instances: HashMap::new(),
                ready: VecDeque::new(),
                waiters: VecDeque::new(),
                interrupts: HashMap::new(),
                closed: false,
                counters: Counters::default(),
            }),
            changed: Notify::new(),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn config(&self) -> Arc<FunctionConfig> {
        self.state.lock().config.clone()
    }

    /// No instance is tracked any more, draining ones included.
    pub fn is_empty(&self) -> bool {
        self.state.lock().instances.is_empty()
    }

    /// Runs `f` under the lock, then hands freed capacity to waiters.
    /// Grants whose waiter went away are dropped after the lock is released.
    fn update<R>(self: &Arc<Self>, f: impl FnOnce(&mut PoolState) -> R) -> R {
        let (result, orphaned) = {
            let mut state = self.state.lock();
            let result = f(&mut *state);
            let orphaned = self.dispatch_waiters(&mut *state);
            (result, orphaned)
        };
        drop(orphaned);
        self.changed.notify_waiters();
        result
    }

    /// Offers capacity freed elsewhere, such as a global slot released by
    /// another function, to queued invocations.
    pub fn retry_waiters(self: &Arc<Self>) {
        self.update(|_| ());
    }

    fn dispatch_waiters(self: &Arc<Self>, state: &mut PoolState) -> Vec<Grant> {
        let mut orphaned = Vec::new();
        loop {
            while state.waiters.front().is_some_and(|w| w.is_closed()) {
                state.waiters.pop_front();
            }
            if state.waiters.is_empty() || state.closed {
                break;
            }
            let grant = match self.take_ready(state) {
                Some(lease) => Grant::Instance(lease),
                None => match self.try_provision(state) {
                    Ok(ticket) => Grant::Provision(ticket),
                    Err(_) => break,
                },
            };
            let Some(waiter) = state.waiters.pop_front() else {
                orphaned.push(grant);
                break;
            };
            if let Err(grant) = waiter.send(grant) {
                orphaned.push(grant);
            }
        }
        orphaned
    }

    fn take_ready(self: &Arc<Self>, state: &mut PoolState) -> Option<Lease> {
        while let Some(id) = state.ready.pop_front() {
            let Some(instance) = state.instances.get_mut(&id) else {
                continue;
            };
            let Some(handle) = instance.handle.clone() else {
                error!(function = %self.function, instance_id = %id, "ready instance has no handle");
                continue;
            };
            if let Err(err) = instance.transition(InstanceState::Busy) {
                error!(function = %self.function, error = %err, "skipping ready instance");
                continue;
            }
            let backend = instance.backend;
            let (tx, rx) = oneshot::channel();
            state.interrupts.insert(id.clone(), tx);
            return Some(Lease {
                pool: self.clone(),
                instance_id: id,
                config: state.config.clone(),
                backend,
                handle,
                interrupt: Some(rx),
                dispatched: false,
                released: false,
            });
        }
        None
    }

    fn try_provision(self: &Arc<Self>, state: &mut PoolState) -> Result<ProvisionTicket, AdmissionDenied> {
        let live = state.live_count();
        let limit = state.config.max_instances as usize;
        if live >= limit {
            return Err(AdmissionDenied::FunctionLimit {
                active: live,
                limit,
            });
        }
        let reservation = self.resources.try_admit(&self.function, &state.config)?;
        let id = InstanceId::generate();
        state.instances.insert(
            id.clone(),
            Instance::provisioning(
                id.clone(),
                &self.function,
                state.config.execution_mode,
                state.generation,
                reservation,
            ),
        );
        debug!(function = %self.function, instance_id = %id, "reserved capacity for a new instance");
        Ok(ProvisionTicket {
            pool: self.clone(),
            instance_id: id,
            config: state.config.clone(),
            settled: false,
        })
    }

    /// Hands out a ready instance round-robin, or the right to provision a
    /// new one, or a place in the FIFO queue when `queue_depth` allows it.
    pub fn acquire(self: &Arc<Self>, queue_depth: Option<usize>) -> Acquire {
        self.update(|state| {
            if state.closed {
                return Acquire::Closed;
            }
            // Newcomers never overtake queued invocations.
            if state.queued() == 0 {
                if let Some(lease) = self.take_ready(state) {
                    return Acquire::Ready(lease);
                }
                match self.try_provision(state) {
                    Ok(ticket) => return Acquire::NeedsProvisioning(ticket),
                    Err(AdmissionDenied::GlobalLimit { active, limit }) => {
                        debug!(function = %self.function, active, limit, "global limit reached");
                        return Acquire::Backpressure(CapacityReason::GlobalLimit);
                    }
                    Err(AdmissionDenied::FunctionLimit { .. }) => {}
                }
            }
            match queue_depth {
                None => Acquire::Backpressure(CapacityReason::FunctionLimit),
                Some(depth) if state.queued() >= depth => {
                    Acquire::Backpressure(CapacityReason::QueueFull)
                }
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Acquire::Queued(rx)
                }
            }
        })
    }

    fn release(self: &Arc<Self>, id: &InstanceId, outcome: Outcome) {
        let now = Instant::now();
        self.update(|state| {
            state.interrupts.remove(id);
            let counters = &mut state.counters;
            let counted = match outcome {
                Outcome::Success => {
                    counters.invocations += 1;
                    true
                }
                Outcome::HandlerFailed | Outcome::Failed(RetireReason::Crashed) => {
                    counters.invocations += 1;
                    counters.errors += 1;
                    true
                }
                Outcome::Failed(RetireReason::Timeout) => {
                    counters.invocations += 1;
                    counters.errors += 1;
                    counters.timeouts += 1;
                    true
                }
                Outcome::Failed(RetireReason::Abandoned) => {
                    counters.invocations += 1;
                    true
                }
                Outcome::Unused | Outcome::Failed(_) => false,
            };

            let generation = state.generation;
            let closed = state.closed;
            let Some(instance) = state.instances.get_mut(id) else {
                return;
            };
            if counted {
                instance.invocations += 1;
            }
            // Already retired by a stop or a drain while the call was running.
            if instance.state() != InstanceState::Busy {
                return;
            }
            let reason = match outcome {
                Outcome::Failed(reason) => reason,
                _ if instance.retire_requested || instance.generation != generation || closed => {
                    RetireReason::Drained
                }
                _ => {
                    if let Err(err) = instance.transition(InstanceState::Ready) {
                        error!(function = %self.function, error = %err, "failed to return instance");
                        RetireReason::Crashed
                    } else {
                        instance.touch(now);
                        state.ready.push_back(id.clone());
                        return;
                    }
                }
            };
            self.retire_locked(state, id, reason);
        })
    }

    /// Moves an instance to `Draining` and tears its backend down in the
    /// background. The reservation goes back once teardown finished,
    /// whether or not it succeeded.
    fn retire_locked(self: &Arc<Self>, state: &mut PoolState, id: &InstanceId, reason: RetireReason) {
        let Some(instance) = state.instances.get_mut(id) else {
            return;
        };
        if let Err(err) = instance.transition(InstanceState::Draining) {
            debug!(function = %self.function, error = %err, "instance already retiring");
            return;
        }
        let handle = instance.handle.clone();
        let backend = instance.backend;
        state.ready.retain(|ready| ready != id);
        if let Some(interrupt) = state.interrupts.remove(id) {
            let _ = interrupt.send(reason);
        }
        info!(
            function = %self.function,
            instance_id = %id,
            reason = %reason,
            "retiring instance"
        );

        let runtime = tokio::runtime::Handle::try_current();
        match (handle, runtime) {
            (Some(handle), Ok(runtime)) => {
                let pool = self.clone();
                let id = id.clone();
                runtime.spawn(async move {
                    pool.stop_backend(backend, &handle).await;
                    pool.finish_teardown(&id);
                });
            }
            (Some(_), Err(_)) => {
                warn!(function = %self.function, instance_id = %id, "no runtime to stop instance on");
                self.terminate_locked(state, id);
            }
            (None, _) => self.terminate_locked(state, id),
        }
    }

    async fn stop_backend(&self, backend: ExecutionMode, handle: &ExecutionHandle) {
        let result = match self.hosts.get(backend) {
            Ok(host) => host.stop(handle).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            error!(
                function = %self.function,
                instance_id = %handle.instance_id,
                error = %format!("{err:#}"),
                "instance teardown failed"
            );
        }
    }

    fn finish_teardown(self: &Arc<Self>, id: &InstanceId) {
        self.update(|state| self.terminate_locked(state, id));
    }

    fn terminate_locked(&self, state: &mut PoolState, id: &InstanceId) {
        let Some(mut instance) = state.instances.remove(id) else {
            return;
        };
        match instance.terminate() {
            // Dropping the reservation hands it back to the resource manager.
            Ok(reservation) => drop(reservation),
            Err(err) => error!(function = %self.function, error = %err, "terminating instance"),
        }
        debug!(function = %self.function, instance_id = %id, "instance terminated");
    }

    /// Forces one instance out of service. Returns `false` when the pool
    /// does not know it (already terminated or never existed).
    pub fn stop_instance(self: &Arc<Self>, id: &InstanceId) -> bool {
        self.update(|state| {
            let Some(instance) = state.instances.get_mut(id) else {
                return false;
            };
            match instance.state() {
                InstanceState::Ready | InstanceState::Busy => {
                    self.retire_locked(state, id, RetireReason::Stopped)
                }
                InstanceState::Provisioning => instance.retire_requested = true,
                InstanceState::Draining | InstanceState::Terminated => {}
            }
            true
        })
    }

    /// Evicts ready instances idle for longer than `ttl`, least recently
    /// used first, without dropping below `min_instances`.
    pub fn sweep(self: &Arc<Self>, now: Instant, ttl: Duration) -> usize {
        self.update(|state| {
            let min = state.config.min_instances as usize;
            let mut live = state.live_count();
            let expired: Vec<InstanceId> = state
                .ready
                .iter()
                .filter(|id| {
                    state
                        .instances
                        .get(*id)
                        .is_some_and(|i| i.idle_for(now) > ttl)
                })
                .cloned()
                .collect();
            let mut evicted = 0;
            for id in expired {
                if live <= min {
                    break;
                }
                self.retire_locked(state, &id, RetireReason::IdleExpired);
                live -= 1;
                evicted += 1;
            }
            state.counters.evictions += evicted as u64;
            evicted
        })
    }

    /// Retires every instance of the current generation. Ready ones go
    /// immediately; busy ones finish their invocation, or are interrupted
    /// once `grace` elapses.
    pub fn drain_all(self: &Arc<Self>, grace: Duration) {
        let (flagged, generation) = self.update(|state| {
            state.generation += 1;
            let mut flagged = Vec::new();
            let ids: Vec<(InstanceId, InstanceState)> = state
                .instances
                .iter()
                .map(|(id, i)| (id.clone(), i.state()))
                .collect();
            for (id, instance_state) in ids {
                match instance_state {
                    InstanceState::Ready => self.retire_locked(state, &id, RetireReason::Drained),
                    InstanceState::Busy | InstanceState::Provisioning => {
                        if let Some(instance) = state.instances.get_mut(&id) {
                            instance.retire_requested = true;
                        }
                        flagged.push(id);
                    }
                    InstanceState::Draining | InstanceState::Terminated => {}
                }
            }
            (flagged, state.generation)
        });
        info!(
            function = %self.function,
            generation,
            in_flight = flagged.len(),
            "draining pool"
        );
        if flagged.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            pool.update(|state| {
                for id in &flagged {
                    let still_busy = state
                        .instances
                        .get(id)
                        .is_some_and(|i| i.state() == InstanceState::Busy);
                    if still_busy {
                        warn!(function = %pool.function, instance_id = %id, "grace period elapsed, interrupting invocation");
                        pool.retire_locked(state, id, RetireReason::Drained);
                    }
                }
            });
        });
    }

    /// Rejects queued and future invocations.
    pub fn close(self: &Arc<Self>) {
        self.update(|state| {
            state.closed = true;
            state.waiters.clear();
        });
    }

    pub fn update_config(self: &Arc<Self>, config: FunctionConfig) {
        self.update(|state| state.config = Arc::new(config));
    }

    /// Instances missing to reach `min_instances`.
    pub fn deficit(&self) -> usize {
        let state = self.state.lock();
        if state.closed {
            return 0;
        }
        (state.config.min_instances as usize).saturating_sub(state.live_count())
    }

    /// Reserves capacity for a pre-warmed instance.
    pub fn reserve_prewarm(self: &Arc<Self>) -> Option<ProvisionTicket> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        match self.try_provision(&mut state) {
            Ok(ticket) => Some(ticket),
            Err(denied) => {
                debug!(function = %self.function, ?denied, "cannot pre-warm");
                None
            }
        }
    }

    /// Resolves once every instance reached `Terminated`.
    pub async fn wait_until_drained(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> FunctionStats {
        let state = self.state.lock();
        FunctionStats {
            function: self.function.clone(),
            ready_count: state.count(InstanceState::Ready),
            busy_count: state.count(InstanceState::Busy),
            provisioning_count: state.count(InstanceState::Provisioning),
            draining_count: state.count(InstanceState::Draining),
            queued: state.queued(),
            cold_starts: state.counters.cold_starts,
            cold_start_failures: state.counters.cold_start_failures,
            invocations: state.counters.invocations,
            errors: state.counters.errors,
            timeouts: state.counters.timeouts,
            evictions: state.counters.evictions,
        }
    }

    pub fn summaries(&self, now: Instant) -> Vec<InstanceSummary> {
        let state = self.state.lock();
        let mut summaries: Vec<InstanceSummary> =
            state.instances.values().map(|i| i.summary(now)).collect();
        summaries.sort_by(|a, b| b.age_ms.cmp(&a.age_ms).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Checks the pool's own bookkeeping: current-generation instances stay
    /// within `max_instances`, the ready queue only holds ready instances and
    /// every live instance still holds its reservation.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        let state = self.state.lock();
        let current = state
            .instances
            .values()
            .filter(|i| i.generation == state.generation && i.state().is_active())
            .count();
        if current > state.config.max_instances as usize {
            anyhow::bail!(
                "function {}: {} live instances exceed max_instances {}",
                self.function,
                current,
                state.config.max_instances
            );
        }
        for id in &state.ready {
            match state.instances.get(id) {
                Some(i) if i.state() == InstanceState::Ready => {}
                _ => anyhow::bail!(
                    "function {}: ready queue holds non-ready instance {}",
                    self.function,
                    id
                ),
            }
        }
        if let Some(leaked) = state.instances.values().find(|i| !i.holds_reservation()) {
            anyhow::bail!(
                "function {}: instance {} lost its reservation",
                self.function,
                leaked.id
            );
        }
        Ok(())
    }

    fn complete_provisioning(
        self: &Arc<Self>,
        id: &InstanceId,
        handle: ExecutionHandle,
        busy: bool,
    ) -> Result<Option<Lease>, RetireReason> {
        self.update(|state| {
            state.counters.cold_starts += 1;
            let generation = state.generation;
            let closed = state.closed;
            let config = state.config.clone();
            let Some(instance) = state.instances.get_mut(id) else {
                return Err(RetireReason::Stopped);
            };
            instance.backend = handle.backend.mode();
            instance.attach(handle.clone());
            let stale = instance.retire_requested || closed || (!busy && instance.generation != generation);
            if stale {
                self.retire_locked(state, id, RetireReason::Stopped);
                return Err(RetireReason::Stopped);
            }
            let next = if busy {
                InstanceState::Busy
            } else {
                InstanceState::Ready
            };
            if let Err(err) = instance.transition(next) {
                error!(function = %self.function, error = %err, "completing provisioning");
                self.retire_locked(state, id, RetireReason::ProvisioningFailed);
                return Err(RetireReason::ProvisioningFailed);
            }
            let backend = instance.backend;
            if !busy {
                state.ready.push_back(id.clone());
                return Ok(None);
            }
            let (tx, rx) = oneshot::channel();
            state.interrupts.insert(id.clone(), tx);
            Ok(Some(Lease {
                pool: self.clone(),
                instance_id: id.clone(),
                config,
                backend,
                handle,
                interrupt: Some(rx),
                dispatched: false,
                released: false,
            }))
        })
    }

    fn fail_provisioning(self: &Arc<Self>, id: &InstanceId, reason: RetireReason) {
        self.update(|state| {
            if reason != RetireReason::Abandoned {
                state.counters.cold_start_failures += 1;
            }
            self.retire_locked(state, id, reason);
        });
    }
}

/// Exclusive use of one busy instance. Dropping it without
/// [`Lease::release`] returns the instance, or retires it if a request was
/// already sent to it.
pub struct Lease {
    pool: Arc<WorkerPool>,
    instance_id: InstanceId,
    config: Arc<FunctionConfig>,
    backend: ExecutionMode,
    handle: ExecutionHandle,
    interrupt: Option<oneshot::Receiver<RetireReason>>,
    dispatched: bool,
    released: bool,
}

impl Lease {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &Arc<FunctionConfig> {
        &self.config
    }

    pub fn backend(&self) -> ExecutionMode {
        self.backend
    }

    pub fn handle(&self) -> &ExecutionHandle {
        &self.handle
    }

    pub fn mark_dispatched(&mut self) {
        self.dispatched = true;
    }

    /// Resolves when the pool retires the instance under the running
    /// invocation (stop or expired drain grace period).
    pub fn interrupted(&mut self) -> impl std::future::Future<Output = RetireReason> + Send + 'static {
        let interrupt = self.interrupt.take();
        async move {
            match interrupt {
                Some(rx) => match rx.await {
                    Ok(reason) => reason,
                    Err(_) => pending().await,
                },
                None => pending().await,
            }
        }
    }

    pub fn release(mut self, outcome: Outcome) {
        self.released = true;
        self.pool.release(&self.instance_id, outcome);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let outcome = if self.dispatched {
            Outcome::Failed(RetireReason::Abandoned)
        } else {
            Outcome::Unused
        };
        self.pool.release(&self.instance_id, outcome);
    }
}

/// Right to start one instance against an already granted reservation.
/// Dropping it unsettled gives the reservation back.
pub struct ProvisionTicket {
    pool: Arc<WorkerPool>,
    instance_id: InstanceId,
    config: Arc<FunctionConfig>,
    settled: bool,
}

impl ProvisionTicket {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &Arc<FunctionConfig> {
        &self.config
    }

    /// Inserts the started instance as `Busy` for the invocation that
    /// provisioned it. Fails when the instance was stopped or drained while
    /// it was starting.
    pub fn complete_busy(mut self, handle: ExecutionHandle) -> Result<Lease, RetireReason> {
        self.settled = true;
        match self.pool.complete_provisioning(&self.instance_id, handle, true)? {
            Some(lease) => Ok(lease),
            None => Err(RetireReason::ProvisioningFailed),
        }
    }

    /// Inserts a pre-warmed instance as `Ready`.
    pub fn complete_ready(mut self, handle: ExecutionHandle) -> Result<(), RetireReason> {
        self.settled = true;
        self.pool
            .complete_provisioning(&self.instance_id, handle, false)
            .map(|_| ())
    }

    pub fn fail(mut self, reason: RetireReason) {
        self.settled = true;
        self.pool.fail_provisioning(&self.instance_id, reason);
    }
}

impl Drop for ProvisionTicket {
    fn drop(&mut self) {
        if !self.settled {
            self.pool
                .fail_provisioning(&self.instance_id, RetireReason::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use data_model::test_objects::tests::mock_function_config;

    use super::*;
    use crate::testing::FakeRuntimeHost;

    struct TestPool {
        pool: Arc<WorkerPool>,
        resources: Arc<ResourceManager>,
        host: Arc<FakeRuntimeHost>,
    }

    fn test_pool(min: u32, max: u32, global: usize) -> TestPool {
        let resources = Arc::new(ResourceManager::new(global));
        let host = Arc::new(FakeRuntimeHost::new(ExecutionMode::Process));
        let hosts = RuntimeHosts::new().with_host(host.clone());
        let pool = Arc::new(WorkerPool::new(
            mock_function_config("f", min, max),
            resources.clone(),
            hosts,
        ));
        TestPool {
            pool,
            resources,
            host,
        }
    }

    fn fake_handle(id: &InstanceId) -> ExecutionHandle {
        ExecutionHandle {
            instance_id: id.clone(),
            address: format!("fake:{}", id),
            backend: crate::runtime_host::BackendHandle::Process {
                pid: 1,
                namespaces: vec![],
                cgroup: None,
            },
        }
    }

    fn provision(pool: &Arc<WorkerPool>) -> Lease {
        let Acquire::NeedsProvisioning(ticket) = pool.acquire(None) else {
            panic!("expected to provision");
        };
        let handle = fake_handle(ticket.instance_id());
        ticket.complete_busy(handle).unwrap()
    }

    fn prewarm(pool: &Arc<WorkerPool>) -> InstanceId {
        let ticket = pool.reserve_prewarm().unwrap();
        let id = ticket.instance_id().clone();
        ticket.complete_ready(fake_handle(&id)).unwrap();
        id
    }

    async fn settle(pool: &Arc<WorkerPool>) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(pool.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_round_robin_over_ready_instances() {
        let t = test_pool(0, 3, 10);
        let a = prewarm(&t.pool);
        let b = prewarm(&t.pool);

        let mut seen = Vec::new();
        for _ in 0..4 {
            let Acquire::Ready(lease) = t.pool.acquire(None) else {
                panic!("expected a ready instance");
            };
            seen.push(lease.instance_id().clone());
            lease.release(Outcome::Success);
        }
        assert_eq!(seen, vec![a.clone(), b.clone(), a, b]);
        assert_eq!(t.pool.stats().invocations, 4);
    }

    #[tokio::test]
    async fn test_limits_and_queue() {
        let t = test_pool(0, 1, 10);
        let lease = provision(&t.pool);
        let stats = t.pool.stats();
        assert_eq!((stats.ready_count, stats.busy_count), (0, 1));
        assert_eq!(stats.cold_starts, 1);

        assert!(matches!(
            t.pool.acquire(None),
            Acquire::Backpressure(CapacityReason::FunctionLimit)
        ));
        let Acquire::Queued(first) = t.pool.acquire(Some(2)) else {
            panic!("expected to queue");
        };
        let Acquire::Queued(second) = t.pool.acquire(Some(2)) else {
            panic!("expected to queue");
        };
        assert!(matches!(
            t.pool.acquire(Some(2)),
            Acquire::Backpressure(CapacityReason::QueueFull)
        ));
        assert_eq!(t.pool.stats().queued, 2);

        let busy_id = lease.instance_id().clone();
        lease.release(Outcome::Success);
        let Ok(Grant::Instance(next)) = first.await else {
            panic!("first waiter should get the instance");
        };
        assert_eq!(next.instance_id(), &busy_id);
        assert_eq!(t.pool.stats().queued, 1);

        next.release(Outcome::Success);
        let Ok(Grant::Instance(last)) = second.await else {
            panic!("second waiter should get the instance");
        };
        drop(last);
        assert_eq!(t.pool.stats().ready_count, 1);
        assert_eq!(t.resources.active(), 1);
        settle(&t.pool).await;
    }

    #[tokio::test]
    async fn test_global_limit_is_not_queued() {
        let t = test_pool(0, 5, 1);
        let _lease = provision(&t.pool);
        assert!(matches!(
            t.pool.acquire(Some(10)),
            Acquire::Backpressure(CapacityReason::GlobalLimit)
        ));
    }

    #[tokio::test]
    async fn test_failure_retires_and_frees_capacity() {
        let t = test_pool(0, 1, 10);
        let lease = provision(&t.pool);
        let Acquire::Queued(waiter) = t.pool.acquire(Some(1)) else {
            panic!("expected to queue");
        };

        lease.release(Outcome::Failed(RetireReason::Timeout));
        let stats = t.pool.stats();
        assert_eq!((stats.ready_count, stats.busy_count), (0, 0));
        assert_eq!(stats.timeouts, 1);

        // Teardown runs in the background and hands the slot to the waiter.
        let Ok(Grant::Provision(ticket)) = waiter.await else {
            panic!("waiter should be allowed to provision");
        };
        assert_eq!(t.host.stops.load(Ordering::SeqCst), 1);
        ticket.fail(RetireReason::ProvisioningFailed);
        settle(&t.pool).await;
        assert_eq!(t.pool.stats().cold_start_failures, 1);
        assert!(t.pool.is_empty());
        assert_eq!(t.resources.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waiters_uses_slot_freed_elsewhere() {
        let t = test_pool(0, 1, 2);
        t.host.set_stop_delay(Duration::from_secs(60));
        let lease = provision(&t.pool);
        let Acquire::Queued(mut waiter) = t.pool.acquire(Some(1)) else {
            panic!("expected to queue");
        };
        let other = t
            .resources
            .try_admit("g", &mock_function_config("g", 0, 1))
            .unwrap();

        // The retired instance keeps its slot until its slow teardown ends.
        lease.release(Outcome::Failed(RetireReason::Crashed));
        assert_eq!(t.pool.stats().draining_count, 1);
        assert!(tokio::time::timeout(Duration::from_secs(1), &mut waiter)
            .await
            .is_err());

        drop(other);
        t.pool.retry_waiters();
        let Ok(Grant::Provision(ticket)) = waiter.await else {
            panic!("waiter should be allowed to provision");
        };
        assert_eq!(t.resources.active(), 2);
        ticket.fail(RetireReason::ProvisioningFailed);
    }

    #[tokio::test]
    async fn test_dropped_ticket_and_lease() {
        let t = test_pool(0, 2, 10);
        let Acquire::NeedsProvisioning(ticket) = t.pool.acquire(None) else {
            panic!("expected to provision");
        };
        assert_eq!(t.resources.active(), 1);
        drop(ticket);
        assert_eq!(t.resources.active(), 0);
        assert_eq!(t.pool.stats().cold_start_failures, 0);

        let lease = provision(&t.pool);
        drop(lease);
        assert_eq!(t.pool.stats().ready_count, 1);

        let Acquire::Ready(mut lease) = t.pool.acquire(None) else {
            panic!("expected a ready instance");
        };
        lease.mark_dispatched();
        drop(lease);
        settle(&t.pool).await;
        assert!(t.pool.is_empty());
        assert_eq!(t.resources.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_respects_min_instances() {
        let t = test_pool(1, 3, 10);
        let oldest = prewarm(&t.pool);
        tokio::time::advance(Duration::from_secs(5)).await;
        prewarm(&t.pool);
        let newest = prewarm(&t.pool);

        let ttl = Duration::from_secs(10);
        assert_eq!(t.pool.sweep(Instant::now(), ttl), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(t.pool.sweep(Instant::now(), ttl), 1);
        let ready: Vec<_> = t
            .pool
            .summaries(Instant::now())
            .into_iter()
            .filter(|s| s.state == InstanceState::Ready)
            .map(|s| s.id)
            .collect();
        assert!(!ready.contains(&oldest));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(t.pool.sweep(Instant::now(), ttl), 1);
        settle(&t.pool).await;
        let stats = t.pool.stats();
        assert_eq!(stats.ready_count, 1);
        assert_eq!(stats.evictions, 2);
        assert_eq!(t.pool.summaries(Instant::now())[0].id, newest);
    }

    #[tokio::test]
    async fn test_stop_instance_is_idempotent() {
        let t = test_pool(0, 2, 10);
        let id = prewarm(&t.pool);
        assert!(t.pool.stop_instance(&id));
        assert!(t.pool.stop_instance(&id));
        settle(&t.pool).await;
        assert!(!t.pool.stop_instance(&id));
        assert_eq!(t.host.stops.load(Ordering::SeqCst), 1);
        assert_eq!(t.resources.active(), 0);
        t.resources.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_stop_interrupts_busy_instance() {
        let t = test_pool(0, 1, 10);
        let mut lease = provision(&t.pool);
        let interrupted = lease.interrupted();
        assert!(t.pool.stop_instance(lease.instance_id()));
        assert_eq!(interrupted.await, RetireReason::Stopped);
        lease.release(Outcome::Failed(RetireReason::Crashed));
        settle(&t.pool).await;
        assert!(t.pool.is_empty());
    }

    #[tokio::test]
    async fn test_stop_during_provisioning() {
        let t = test_pool(0, 1, 10);
        let Acquire::NeedsProvisioning(ticket) = t.pool.acquire(None) else {
            panic!("expected to provision");
        };
        assert!(t.pool.stop_instance(ticket.instance_id()));
        let handle = fake_handle(ticket.instance_id());
        assert_eq!(ticket.complete_busy(handle).err(), Some(RetireReason::Stopped));
        settle(&t.pool).await;
        assert!(t.pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_all_with_grace_period() {
        let t = test_pool(0, 3, 10);
        prewarm(&t.pool);
        let finishing = provision(&t.pool);
        let mut slow = provision(&t.pool);
        let interrupted = slow.interrupted();

        t.pool.drain_all(Duration::from_secs(5));
        let stats = t.pool.stats();
        assert_eq!(stats.ready_count, 0);
        assert_eq!(stats.busy_count, 2);

        // Finished within grace: retired instead of returning to ready.
        finishing.release(Outcome::Success);
        assert_eq!(t.pool.stats().ready_count, 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(interrupted.await, RetireReason::Drained);
        slow.release(Outcome::Failed(RetireReason::Timeout));

        tokio::time::timeout(Duration::from_secs(1), t.pool.wait_until_drained())
            .await
            .unwrap();
        assert_eq!(t.resources.active(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_waiters() {
        let t = test_pool(0, 1, 10);
        let _lease = provision(&t.pool);
        let Acquire::Queued(waiter) = t.pool.acquire(Some(5)) else {
            panic!("expected to queue");
        };
        t.pool.close();
        assert!(waiter.await.is_err());
        assert!(matches!(t.pool.acquire(Some(5)), Acquire::Closed));
        assert_eq!(t.pool.deficit(), 0);
    }
}
