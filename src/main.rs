use std::path::PathBuf;

use ::tracing::{error, info, info_span};
use clap::Parser;
use service::Service;

mod config;
mod http_objects;
mod metrics;
mod routes;
mod service;
mod tracing;
use tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => config::ServerConfig::from_path(&path),
        None => config::ServerConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {err:#}");
            std::process::exit(1);
        }
    };

    setup_tracing(&config);

    let instance_id = config.instance_id();
    let root_span = info_span!("faas", env = config.env, "faas-instance" = instance_id);
    let _guard = root_span.enter();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        rustc = env!("VERGEN_RUSTC_SEMVER"),
        built_at = env!("VERGEN_BUILD_TIMESTAMP"),
        "starting faas-server"
    );

    let meter_provider = match metrics::init_provider(
        config.telemetry.enable_metrics,
        config.telemetry.endpoint.as_ref(),
        config.telemetry.metrics_interval,
        &instance_id,
        env!("CARGO_PKG_VERSION"),
    ) {
        Ok(provider) => provider,
        Err(err) => {
            error!("Error setting up metrics: {:?}", err);
            return;
        }
    };

    match Service::new(config).await {
        Ok(mut service) => {
            if let Err(err) = service.start().await {
                error!("Error starting service: {:?}", err);
            }
        }
        Err(err) => error!("Error creating service: {:?}", err),
    }

    // export metrics before shutdown
    if let Some(provider) = meter_provider {
        if let Err(err) = provider.shutdown() {
            error!("Error shutting down meter provider: {:?}", err);
        }
    }
}
