use std::time::Duration;

use data_model::{duration_secs, ExecutionMode};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

const DEFAULT_MAX_CONCURRENT_FUNCTIONS: usize = 1000;
const DEFAULT_COLD_START_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WARM_INSTANCE_TTL: Duration = Duration::from_secs(600);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_DRAIN_GRACE_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_MAX_QUEUE_DEPTH: usize = 100;

fn default_max_queue_depth() -> usize {
    DEFAULT_MAX_QUEUE_DEPTH
}

/// What an invocation does when its function is at `max_instances`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait FIFO for a free instance, at most `cold_start_timeout`.
    Queue {
        #[serde(default = "default_max_queue_depth")]
        max_queue_depth: usize,
    },
    /// Fail immediately with a capacity error.
    Reject,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Queue {
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

impl BackpressurePolicy {
    /// Bound on waiters, `None` when waiting is disabled.
    pub fn queue_depth(&self) -> Option<usize> {
        match self {
            BackpressurePolicy::Queue { max_queue_depth } => Some(*max_queue_depth),
            BackpressurePolicy::Reject => None,
        }
    }
}

/// Cold start retries. Retries keep the instance's reservation.
#[serde_inline_default]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningPolicy {
    #[serde_inline_default(0)]
    pub max_retries: u32,
    /// Backend used for every attempt after the first failed one.
    #[serde(default)]
    pub fallback_mode: Option<ExecutionMode>,
}

impl ProvisioningPolicy {
    /// Backend for the given zero-based attempt.
    pub fn mode_for_attempt(&self, configured: ExecutionMode, attempt: u32) -> ExecutionMode {
        match (attempt, self.fallback_mode) {
            (0, _) | (_, None) => configured,
            (_, Some(fallback)) => fallback,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSettings {
    #[serde_inline_default(DEFAULT_MAX_CONCURRENT_FUNCTIONS)]
    pub max_concurrent_functions: usize,
    #[serde_inline_default(DEFAULT_COLD_START_TIMEOUT)]
    #[serde(with = "duration_secs")]
    pub cold_start_timeout: Duration,
    #[serde_inline_default(DEFAULT_WARM_INSTANCE_TTL)]
    #[serde(with = "duration_secs")]
    pub warm_instance_ttl: Duration,
    #[serde_inline_default(DEFAULT_SWEEP_INTERVAL)]
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    #[serde_inline_default(DEFAULT_DRAIN_GRACE_PERIOD)]
    #[serde(with = "duration_secs")]
    pub drain_grace_period: Duration,
    #[serde_inline_default(true)]
    pub health_check_before_dispatch: bool,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    #[serde(default)]
    pub provisioning: ProvisioningPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_functions: DEFAULT_MAX_CONCURRENT_FUNCTIONS,
            cold_start_timeout: DEFAULT_COLD_START_TIMEOUT,
            warm_instance_ttl: DEFAULT_WARM_INSTANCE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            drain_grace_period: DEFAULT_DRAIN_GRACE_PERIOD,
            health_check_before_dispatch: true,
            backpressure: BackpressurePolicy::default(),
            provisioning: ProvisioningPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_functions == 0 {
            anyhow::bail!("max_concurrent_functions must be at least 1");
        }
        for (name, value) in [
            ("cold_start_timeout", self.cold_start_timeout),
            ("warm_instance_ttl", self.warm_instance_ttl),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be positive", name);
            }
        }
        Ok(())
    }
}
