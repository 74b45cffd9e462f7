use data_model::{ExecutionMode, InstanceId, InstanceState, InstanceSummary};
use tokio::time::{Duration, Instant};

use crate::{error::InvalidTransition, resource_manager::Reservation, runtime_host::ExecutionHandle};

/// One execution unit of a function. Owned by exactly one worker pool.
///
/// The resource reservation lives inside the instance and is handed back
/// only on the `Draining -> Terminated` transition.
#[derive(Debug)]
pub struct Instance {
    pub id: InstanceId,
    pub function: String,
    pub backend: ExecutionMode,
    state: InstanceState,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub handle: Option<ExecutionHandle>,
    reservation: Option<Reservation>,
    pub invocations: u64,
    /// Deployment generation the instance was provisioned for.
    pub generation: u64,
    /// Set when a drain or stop arrives while the instance is busy or still
    /// provisioning.
    pub retire_requested: bool,
}

impl Instance {
    pub fn provisioning(
        id: InstanceId,
        function: &str,
        backend: ExecutionMode,
        generation: u64,
        reservation: Reservation,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            function: function.to_string(),
            backend,
            state: InstanceState::Provisioning,
            created_at: now,
            last_used_at: now,
            handle: None,
            reservation: Some(reservation),
            invocations: 0,
            generation,
            retire_requested: false,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn transition(&mut self, next: InstanceState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                instance_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        if next == InstanceState::Busy {
            self.last_used_at = Instant::now();
        }
        self.state = next;
        Ok(())
    }

    /// Moves a draining instance to `Terminated` and gives back its
    /// reservation. Returns `None` if it was already given back.
    pub fn terminate(&mut self) -> Result<Option<Reservation>, InvalidTransition> {
        self.transition(InstanceState::Terminated)?;
        Ok(self.reservation.take())
    }

    pub fn attach(&mut self, handle: ExecutionHandle) {
        self.handle = Some(handle);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_used_at = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    pub fn holds_reservation(&self) -> bool {
        self.reservation.is_some()
    }

    pub fn summary(&self, now: Instant) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            function: self.function.clone(),
            state: self.state,
            backend: self.backend,
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
            idle_ms: self.idle_for(now).as_millis() as u64,
            invocations: self.invocations,
        }
    }
}
