use std::time::Duration;

use data_model::{ExecutionMode, InstanceId};
use serde::Serialize;
use strum::AsRefStr;
use thiserror::Error;

/// Why an invocation could not get an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CapacityReason {
    /// `max_concurrent_functions` reached across all functions.
    GlobalLimit,
    /// The function already runs `max_instances` instances.
    FunctionLimit,
    /// Too many invocations are already waiting for this function.
    QueueFull,
    /// Waited `cold_start_timeout` without getting an instance.
    WaitTimedOut,
}

impl std::fmt::Display for CapacityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// Errors surfaced by [`crate::ExecutionManager::invoke`]. Each one is
/// scoped to a single function or instance.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("function {0} not found")]
    FunctionNotFound(String),

    #[error("capacity exceeded for function {function}: {reason}")]
    CapacityExceeded {
        function: String,
        reason: CapacityReason,
    },

    #[error("failed to provision an instance of {function}: {message}")]
    ProvisioningFailure { function: String, message: String },

    #[error("invocation of {function} timed out after {timeout:?}")]
    InvocationTimeout { function: String, timeout: Duration },

    #[error("handler of {function} failed with status {status}: {message}")]
    HandlerError {
        function: String,
        status: u16,
        message: String,
    },

    #[error("instance {instance_id} of {function} became unhealthy: {message}")]
    BackendUnhealthy {
        function: String,
        instance_id: InstanceId,
        message: String,
    },
}

/// Errors reported by a runtime host adapter.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("no runtime host configured for {0} execution")]
    NoBackend(ExecutionMode),

    #[error("instance did not become ready within {0:?}")]
    StartTimeout(Duration),

    #[error("failed to start instance: {0:#}")]
    Start(anyhow::Error),

    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler returned status {status}: {message}")]
    Handler { status: u16, message: String },

    #[error("runtime unreachable: {0:#}")]
    Unreachable(anyhow::Error),
}

/// A state change the lifecycle does not allow.
#[derive(Debug, Error)]
#[error("instance {instance_id}: invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub instance_id: InstanceId,
    pub from: data_model::InstanceState,
    pub to: data_model::InstanceState,
}
