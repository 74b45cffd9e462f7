pub mod error;
pub mod execution_manager;
pub mod instance;
pub mod metrics;
pub mod registry;
pub mod resource_manager;
pub mod runtime_host;
pub mod settings;
pub mod sweeper;
pub mod worker_pool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use error::{CapacityReason, HostError, InvocationError};
pub use execution_manager::{ExecutionManager, Overview};
pub use registry::{FunctionRegistry, InMemoryFunctionRegistry};
pub use resource_manager::{ResourceManager, ResourceSnapshot};
pub use runtime_host::{RuntimeHost, RuntimeHosts};
pub use settings::{BackpressurePolicy, OrchestratorSettings, ProvisioningPolicy};
pub use sweeper::Sweeper;
