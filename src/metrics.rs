use std::time::Duration;

use anyhow::Result;
use opentelemetry::{
    global,
    metrics::{Counter, UpDownCounter},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

use crate::config::ServerConfig;

pub const SERVICE_NAME: &str = "hermes-server";

/// Exports metrics over OTLP when enabled. Without a provider the global
/// meter is a no-op and the counters below cost nothing.
pub fn init_provider(config: &ServerConfig) -> Result<Option<SdkMeterProvider>> {
    if !config.telemetry.enable_metrics {
        return Ok(None);
    }

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        exporter = exporter.with_endpoint(endpoint.clone());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(config.telemetry.metrics_interval))
        .build();
    let resource = Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attribute(KeyValue::new("hermes-instance", config.instance_id()))
        .build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();
    global::set_meter_provider(provider.clone());

    Ok(Some(provider))
}

pub struct WorkerPoolMetrics {
    pub workers_started: Counter<u64>,
    pub startup_failures: Counter<u64>,
    pub workers_stopped: Counter<u64>,
    pub consume_timeouts: Counter<u64>,
    pub runs_in_flight: UpDownCounter<i64>,
}

impl WorkerPoolMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            workers_started: meter
                .u64_counter("hermes.workers.started")
                .with_description("Workers whose container reported a successful startup")
                .build(),
            startup_failures: meter
                .u64_counter("hermes.workers.startup_failures")
                .with_description("Failed worker startup attempts")
                .build(),
            workers_stopped: meter
                .u64_counter("hermes.workers.stopped")
                .with_description("Workers shut down, either idle or at service shutdown")
                .build(),
            consume_timeouts: meter
                .u64_counter("hermes.pool.consume_timeouts")
                .with_description("Worker requests that timed out waiting in a pool")
                .build(),
            runs_in_flight: meter
                .i64_up_down_counter("hermes.runs.in_flight")
                .with_description("Runs forwarded to a worker and not yet done")
                .build(),
        }
    }
}

impl Default for WorkerPoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub fn function_attributes(function_id: &str) -> [KeyValue; 1] {
    [KeyValue::new("function_id", function_id.to_string())]
}
