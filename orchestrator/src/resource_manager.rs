use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use anyhow::{bail, Result};
use data_model::{FunctionConfig, ResourceLimits};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{futures::Notified, Notify};
use tracing::{error, warn};

use crate::error::CapacityReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenied {
    GlobalLimit { active: usize, limit: usize },
    FunctionLimit { active: usize, limit: usize },
}

impl From<AdmissionDenied> for CapacityReason {
    fn from(value: AdmissionDenied) -> Self {
        match value {
            AdmissionDenied::GlobalLimit { .. } => CapacityReason::GlobalLimit,
            AdmissionDenied::FunctionLimit { .. } => CapacityReason::FunctionLimit,
        }
    }
}

#[derive(Debug, Default)]
struct Budget {
    active: usize,
    per_function: HashMap<String, usize>,
    memory_bytes: u64,
    cpu_millicores: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub active: usize,
    pub max_concurrent_functions: usize,
    pub per_function: BTreeMap<String, usize>,
    pub reserved_memory_bytes: u64,
    pub reserved_cpu_millicores: u64,
}

/// Process-wide admission control.
///
/// Every granted admission is a [`Reservation`]; the counters only go down
/// when a reservation is released, which happens exactly once.
pub struct ResourceManager {
    max_concurrent_functions: usize,
    budget: Mutex<Budget>,
    released: Notify,
}

impl ResourceManager {
    pub fn new(max_concurrent_functions: usize) -> Self {
        Self {
            max_concurrent_functions,
            budget: Mutex::new(Budget::default()),
            released: Notify::new(),
        }
    }

    /// Resolves after the next reservation of any function is released.
    /// Only wakes futures that were polled or enabled before the release.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Checks both limits and reserves a slot in one step.
    pub fn try_admit(
        self: &Arc<Self>,
        function: &str,
        config: &FunctionConfig,
    ) -> Result<Reservation, AdmissionDenied> {
        // Limits were validated on deploy; an unparseable value reserves nothing.
        let limits = config.limits().unwrap_or_default();
        let mut budget = self.budget.lock();
        if budget.active >= self.max_concurrent_functions {
            return Err(AdmissionDenied::GlobalLimit {
                active: budget.active,
                limit: self.max_concurrent_functions,
            });
        }
        let function_active = budget.per_function.get(function).copied().unwrap_or(0);
        if function_active >= config.max_instances as usize {
            return Err(AdmissionDenied::FunctionLimit {
                active: function_active,
                limit: config.max_instances as usize,
            });
        }
        budget.active += 1;
        *budget.per_function.entry(function.to_string()).or_insert(0) += 1;
        budget.memory_bytes += limits.memory_bytes;
        budget.cpu_millicores += limits.cpu_millicores;
        Ok(Reservation {
            manager: self.clone(),
            function: function.to_string(),
            limits,
            released: false,
        })
    }

    fn release(&self, function: &str, limits: &ResourceLimits) {
        let mut budget = self.budget.lock();
        match budget.per_function.get_mut(function) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    budget.per_function.remove(function);
                }
            }
            _ => {
                error!(function, "releasing a reservation the budget does not hold");
                return;
            }
        }
        budget.active = budget.active.saturating_sub(1);
        budget.memory_bytes = budget.memory_bytes.saturating_sub(limits.memory_bytes);
        budget.cpu_millicores = budget.cpu_millicores.saturating_sub(limits.cpu_millicores);
        drop(budget);
        self.released.notify_waiters();
    }

    pub fn active(&self) -> usize {
        self.budget.lock().active
    }

    pub fn active_for(&self, function: &str) -> usize {
        self.budget
            .lock()
            .per_function
            .get(function)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let budget = self.budget.lock();
        ResourceSnapshot {
            active: budget.active,
            max_concurrent_functions: self.max_concurrent_functions,
            per_function: budget
                .per_function
                .iter()
                .map(|(name, count)| (name.clone(), *count))
                .collect(),
            reserved_memory_bytes: budget.memory_bytes,
            reserved_cpu_millicores: budget.cpu_millicores,
        }
    }

    /// Verifies the per-function counts add up and the global limit holds.
    pub fn check_invariants(&self) -> Result<()> {
        let budget = self.budget.lock();
        let sum: usize = budget.per_function.values().sum();
        if sum != budget.active {
            bail!(
                "per-function reservations ({}) do not match the global count ({})",
                sum,
                budget.active
            );
        }
        if budget.active > self.max_concurrent_functions {
            bail!(
                "{} active instances exceed max_concurrent_functions {}",
                budget.active,
                self.max_concurrent_functions
            );
        }
        Ok(())
    }
}

/// A granted admission. Released on [`Reservation::release`] or on drop.
pub struct Reservation {
    manager: Arc<ResourceManager>,
    function: String,
    limits: ResourceLimits,
    released: bool,
}

impl Reservation {
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            warn!(function = %self.function, "reservation already released");
            return;
        }
        self.released = true;
        self.manager.release(&self.function, &self.limits);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            self.release_once();
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("function", &self.function)
            .field("limits", &self.limits)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use data_model::test_objects::tests::mock_function_config;

    use super::*;

    #[test]
    fn test_admission_limits() {
        let resources = Arc::new(ResourceManager::new(3));
        let f = mock_function_config("f", 0, 2);
        let g = mock_function_config("g", 0, 5);

        let r1 = resources.try_admit("f", &f).unwrap();
        let _r2 = resources.try_admit("f", &f).unwrap();
        assert_eq!(
            resources.try_admit("f", &f).unwrap_err(),
            AdmissionDenied::FunctionLimit {
                active: 2,
                limit: 2
            }
        );

        let _r3 = resources.try_admit("g", &g).unwrap();
        assert_eq!(
            resources.try_admit("g", &g).unwrap_err(),
            AdmissionDenied::GlobalLimit {
                active: 3,
                limit: 3
            }
        );

        r1.release();
        assert_eq!(resources.active_for("f"), 1);
        let _r4 = resources.try_admit("g", &g).unwrap();
        resources.check_invariants().unwrap();
    }

    #[test]
    fn test_reservation_released_exactly_once() {
        let resources = Arc::new(ResourceManager::new(10));
        let f = mock_function_config("f", 0, 2);

        let reservation = resources.try_admit("f", &f).unwrap();
        let snapshot = resources.snapshot();
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.reserved_memory_bytes, 256 * 1024 * 1024);
        assert_eq!(snapshot.reserved_cpu_millicores, 100);

        reservation.release();
        let snapshot = resources.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.reserved_memory_bytes, 0);
        assert!(snapshot.per_function.is_empty());

        {
            let _dropped = resources.try_admit("f", &f).unwrap();
            assert_eq!(resources.active(), 1);
        }
        assert_eq!(resources.active(), 0);
        resources.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_release_wakes_listeners() {
        let resources = Arc::new(ResourceManager::new(1));
        let f = mock_function_config("f", 0, 1);
        let reservation = resources.try_admit("f", &f).unwrap();

        let released = resources.released();
        tokio::pin!(released);
        released.as_mut().enable();
        reservation.release();
        tokio::time::timeout(std::time::Duration::from_secs(1), released)
            .await
            .unwrap();
        assert_eq!(resources.active(), 0);
    }

    #[test]
    fn test_concurrent_admission_never_overshoots() {
        let resources = Arc::new(ResourceManager::new(8));
        let f = Arc::new(mock_function_config("f", 0, 100));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let resources = resources.clone();
                let f = f.clone();
                thread::spawn(move || resources.try_admit("f", &f).ok())
            })
            .collect();
        let granted: Vec<Reservation> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(granted.len(), 8);
        assert_eq!(resources.active(), 8);
        resources.check_invariants().unwrap();
        drop(granted);
        assert_eq!(resources.active(), 0);
    }
}
