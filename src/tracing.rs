use tracing::error;
use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    layer::SubscriberExt,
    EnvFilter,
    Layer,
};

use crate::config::ServerConfig;

/// `RUST_LOG` when set. Otherwise INFO, with orchestrator debug events
/// included for local runs.
fn env_filter(config: &ServerConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let filter = EnvFilter::default().add_directive(LevelFilter::INFO.into());
        if config.structured_logging() {
            return filter;
        }
        match "orchestrator=debug".parse::<Directive>() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        }
    })
}

fn log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            json_subscriber::fmt::layer()
                .with_span_list(false)
                .flatten_event(true)
                .flatten_current_span_on_top_level(true),
        );
    }

    Box::new(tracing_subscriber::fmt::layer().compact())
}

pub fn setup_tracing(config: &ServerConfig) {
    let subscriber = tracing_subscriber::Registry::default()
        .with(log_layer(config).with_filter(env_filter(config)));
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }
}
