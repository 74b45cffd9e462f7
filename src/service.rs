use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum_server::Handle;
use orchestrator::{
    runtime_host::{ContainerHost, ProcessHost},
    ExecutionManager,
    InMemoryFunctionRegistry,
    RuntimeHosts,
    Sweeper,
};
use tokio::{self, signal, sync::watch};
use tracing::{error, info, warn};

use crate::{
    config::ServerConfig,
    routes::{create_routes, RouteState},
};

pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub manager: Arc<ExecutionManager>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let hosts = runtime_hosts(&config).await?;
        let manager = Arc::new(ExecutionManager::new(
            Arc::new(InMemoryFunctionRegistry::new()),
            hosts,
            config.orchestrator.clone(),
        ));
        for function in &config.functions {
            manager
                .deploy(function.clone())
                .with_context(|| format!("error deploying preset function {}", function.name))?;
        }

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            manager,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        let mut sweeper = Sweeper::new(self.manager.clone(), self.shutdown_rx.clone());
        tokio::spawn(async move {
            sweeper.start().await;
        });

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let grace = self.config.orchestrator.drain_grace_period;
        tokio::spawn(async move {
            shutdown_signal(handle_sh, shutdown_tx, grace).await;
        });

        let addr: SocketAddr = self.config.listen_addr.parse()?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(RouteState {
            manager: self.manager.clone(),
        });
        axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await?;

        self.manager.shutdown().await;
        info!("all function instances stopped");
        Ok(())
    }
}

/// The process host is always available. The container host is optional: a
/// missing Docker daemon only disables container-mode functions.
async fn runtime_hosts(config: &ServerConfig) -> Result<RuntimeHosts> {
    let process_host = ProcessHost::new(config.process_host.clone())
        .context("error initializing process host")?;
    let mut hosts = RuntimeHosts::new().with_host(Arc::new(process_host));

    if !config.container_host.enabled {
        info!("container host disabled");
        return Ok(hosts);
    }
    match ContainerHost::new(config.container_host.clone()) {
        Ok(container_host) => {
            match container_host.remove_stale_containers().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "removed containers left by a previous run"),
                Err(err) => warn!(
                    error = %format!("{err:#}"),
                    "unable to clean up stale containers, is the docker daemon running?"
                ),
            }
            hosts = hosts.with_host(Arc::new(container_host));
        }
        Err(err) => warn!(
            error = %format!("{err:#}"),
            "container host unavailable, container-mode functions cannot be deployed"
        ),
    }
    info!(backends = ?hosts.modes(), "runtime hosts ready");
    Ok(hosts)
}

async fn shutdown_signal(handle: Handle, shutdown_tx: watch::Sender<()>, grace: Duration) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.graceful_shutdown(Some(grace));
    if shutdown_tx.send(()).is_err() {
        warn!("no background task was listening for shutdown");
    }
    info!("signal received, shutting down server gracefully");
}
