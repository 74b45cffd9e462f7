use std::time::Duration;

use anyhow::Result;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

/// Installs the global meter provider exporting over OTLP. Without it the
/// orchestrator's instruments are no-ops.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "faas"))
        .with_attribute(KeyValue::new("service.name", "faas-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .with_attribute(KeyValue::new("faas.instance.id", instance_id.to_string()))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_install_nothing() -> Result<()> {
        let provider = init_provider(false, None, Duration::from_secs(10), "local-1", "0.1.0")?;
        assert!(provider.is_none());
        Ok(())
    }
}
