use std::time::Duration;

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
        300.0,
    ]
}

pub fn function_labels(function: &str) -> [KeyValue; 1] {
    [KeyValue::new("function", function.to_string())]
}

/// Orchestrator counters. Recorded against the global meter provider, so they
/// are no-ops until the server installs an exporter.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    pub cold_starts: Counter<u64>,
    pub cold_start_failures: Counter<u64>,
    pub cold_start_latency: Histogram<f64>,
    pub invocations: Counter<u64>,
    pub invocation_errors: Counter<u64>,
    pub invocation_timeouts: Counter<u64>,
    pub invocation_latency: Histogram<f64>,
    pub evictions: Counter<u64>,
    pub admission_denials: Counter<u64>,
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorMetrics {
    pub fn new() -> OrchestratorMetrics {
        let meter = opentelemetry::global::meter("orchestrator");
        OrchestratorMetrics {
            cold_starts: meter
                .u64_counter("faas.cold_starts")
                .with_description("instances provisioned")
                .build(),
            cold_start_failures: meter
                .u64_counter("faas.cold_start_failures")
                .with_description("failed provisioning attempts")
                .build(),
            cold_start_latency: meter
                .f64_histogram("faas.cold_start_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("time to start an instance in seconds")
                .build(),
            invocations: meter
                .u64_counter("faas.invocations")
                .with_description("invocations dispatched to an instance")
                .build(),
            invocation_errors: meter
                .u64_counter("faas.invocation_errors")
                .with_description("invocations that returned an error")
                .build(),
            invocation_timeouts: meter
                .u64_counter("faas.invocation_timeouts")
                .with_description("invocations that exceeded the function timeout")
                .build(),
            invocation_latency: meter
                .f64_histogram("faas.invocation_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("invocation round trip in seconds")
                .build(),
            evictions: meter
                .u64_counter("faas.evictions")
                .with_description("warm instances evicted by the TTL sweeper")
                .build(),
            admission_denials: meter
                .u64_counter("faas.admission_denials")
                .with_description("invocations rejected for lack of capacity")
                .build(),
        }
    }

    pub fn record_cold_start(&self, function: &str, elapsed: Duration, ok: bool) {
        let labels = function_labels(function);
        if ok {
            self.cold_starts.add(1, &labels);
        } else {
            self.cold_start_failures.add(1, &labels);
        }
        self.cold_start_latency
            .record(elapsed.as_secs_f64(), &labels);
    }
}
