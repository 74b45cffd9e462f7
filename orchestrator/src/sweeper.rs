use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::execution_manager::ExecutionManager;

/// Background timer driving [`ExecutionManager::sweep_once`].
pub struct Sweeper {
    manager: Arc<ExecutionManager>,
    interval: Duration,
    shutdown_rx: watch::Receiver<()>,
}

impl Sweeper {
    pub fn new(manager: Arc<ExecutionManager>, shutdown_rx: watch::Receiver<()>) -> Self {
        let interval = manager.settings().sweep_interval;
        Self {
            manager,
            interval,
            shutdown_rx,
        }
    }

    pub async fn start(&mut self) {
        info!(interval_secs = self.interval.as_secs_f64(), "starting ttl sweeper");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let evicted = self.manager.sweep_once();
                    debug!(evicted, "sweep finished");
                }
                _ = self.shutdown_rx.changed() => {
                    info!("ttl sweeper shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_function_config, mock_request};

    use super::*;
    use crate::{settings::OrchestratorSettings, testing::TestHarness};

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_idle_instances() -> anyhow::Result<()> {
        let settings = OrchestratorSettings {
            warm_instance_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let t = TestHarness::new(settings);
        t.manager.deploy(mock_function_config("f", 0, 2))?;
        t.manager.invoke("f", mock_request("")).await?;
        assert_eq!(t.manager.stats("f")?.ready_count, 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let mut sweeper = Sweeper::new(t.manager.clone(), shutdown_rx);
        let task = tokio::spawn(async move { sweeper.start().await });

        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(t.manager.stats("f")?.ready_count, 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        let stats = t.manager.stats("f")?;
        assert_eq!((stats.ready_count, stats.evictions), (0, 1));

        shutdown_tx.send(())?;
        task.await?;
        Ok(())
    }
}
