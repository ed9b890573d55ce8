use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

/// Installs the global meter provider exporting over OTLP.
///
/// Meters created before this call, or when metrics are disabled, record
/// into the no-op provider.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.name", "schema-server"))
        .with_attribute(KeyValue::new("schema.instance.id", instance_id.to_string()))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
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
    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: labels.to_vec(),
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

#[derive(Clone)]
pub struct SchemaMetrics {
    pub migrations_applied: Counter<u64>,
    pub migrations_reverted: Counter<u64>,
    pub migration_failures: Counter<u64>,
    pub migration_duration: Histogram<f64>,
    pub singleton_writes: Counter<u64>,
    pub singleton_conflicts: Counter<u64>,
    pub index_creates: Counter<u64>,
    pub index_create_errors: Counter<u64>,
    pub lock_wait: Histogram<f64>,
}

impl Default for SchemaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("state_store");

        let migrations_applied = meter
            .u64_counter("schema.migrations_applied")
            .with_description("Number of migration steps applied")
            .build();

        let migrations_reverted = meter
            .u64_counter("schema.migrations_reverted")
            .with_description("Number of migration steps reverted")
            .build();

        let migration_failures = meter
            .u64_counter("schema.migration_failures")
            .with_description("Number of migration steps that failed")
            .build();

        let migration_duration = meter
            .f64_histogram("schema.migration_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("Migration step latency in seconds")
            .build();

        let singleton_writes = meter
            .u64_counter("schema.singleton_writes")
            .with_description("Number of committed singleton document writes")
            .build();

        let singleton_conflicts = meter
            .u64_counter("schema.singleton_conflicts")
            .with_description("Number of singleton writes that lost the revision race")
            .build();

        let index_creates = meter
            .u64_counter("schema.index_creates")
            .with_description("Number of secondary indexes created")
            .build();

        let index_create_errors = meter
            .u64_counter("schema.index_create_errors")
            .with_description("Number of secondary index creations that failed")
            .build();

        let lock_wait = meter
            .f64_histogram("schema.lock_wait_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("Time spent waiting for the schema upgrade lock in seconds")
            .build();

        Self {
            migrations_applied,
            migrations_reverted,
            migration_failures,
            migration_duration,
            singleton_writes,
            singleton_conflicts,
            index_creates,
            index_create_errors,
            lock_wait,
        }
    }
}
