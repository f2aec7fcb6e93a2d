//! Tracing subscriber and OpenTelemetry export.
//!
//! Without an OTLP endpoint only the fmt layer is installed. With one, spans,
//! metrics and log events are also exported over gRPC to that endpoint.

pub mod metrics;
pub mod run;

use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Owns the OTel providers. Dropping it shuts them down, flushing what is
/// still buffered, so hold it until the process exits.
#[derive(Default)]
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

struct Exporters {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl TelemetryGuard {
    pub fn force_flush(&self) {
        if let Some(e) = &self.exporters {
            let _ = e.traces.force_flush();
            let _ = e.metrics.force_flush();
            let _ = e.logs.force_flush();
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(e) = self.exporters.take() {
            let _ = e.logs.shutdown();
            let _ = e.metrics.shutdown();
            let _ = e.traces.shutdown();
        }
    }
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: tracing_subscriber::util::TryInitError) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}

/// Install the global tracing subscriber and, when configured, OTLP export.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard::default());
    };

    let resource = Resource::builder()
        .with_service_name(config.service_name)
        .with_attribute(opentelemetry::KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build();
    let exporters = build_exporters(&endpoint, resource)?;

    opentelemetry::global::set_meter_provider(exporters.metrics.clone());

    let trace_layer =
        tracing_opentelemetry::layer().with_tracer(exporters.traces.tracer("batchflow"));
    let log_layer =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&exporters.logs);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        exporters: Some(exporters),
    })
}

fn build_exporters(endpoint: &str, resource: Resource) -> Result<Exporters> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("span"))?;
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("metric"))?;
    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("log"))?;

    Ok(Exporters {
        traces: SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build(),
        metrics: SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource.clone())
            .build(),
        logs: SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build(),
    })
}
