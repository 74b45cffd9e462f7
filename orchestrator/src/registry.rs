//! Where function deployments live. The orchestrator only reads from it on
//! the invocation path; deploy and delete go through the
//! [`crate::ExecutionManager`] so pools are drained alongside.

use std::collections::BTreeMap;

use data_model::FunctionConfig;
use parking_lot::RwLock;

pub trait FunctionRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<FunctionConfig>;

    /// Stores `config`, returning the deployment it replaced.
    fn put(&self, config: FunctionConfig) -> Option<FunctionConfig>;

    fn remove(&self, name: &str) -> Option<FunctionConfig>;

    /// All deployments ordered by name.
    fn list(&self) -> Vec<FunctionConfig>;
}

/// Process-local registry, rebuilt from configuration on restart.
#[derive(Default)]
pub struct InMemoryFunctionRegistry {
    functions: RwLock<BTreeMap<String, FunctionConfig>>,
}

impl InMemoryFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FunctionRegistry for InMemoryFunctionRegistry {
    fn get(&self, name: &str) -> Option<FunctionConfig> {
        self.functions.read().get(name).cloned()
    }

    fn put(&self, config: FunctionConfig) -> Option<FunctionConfig> {
        self.functions.write().insert(config.name.clone(), config)
    }

    fn remove(&self, name: &str) -> Option<FunctionConfig> {
        self.functions.write().remove(name)
    }

    fn list(&self) -> Vec<FunctionConfig> {
        self.functions.read().values().cloned().collect()
    }
}
