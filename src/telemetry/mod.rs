//! Process-wide tracing and OpenTelemetry setup for a worker.
//!
//! Every worker logs to stderr. When an OTLP endpoint is configured the same
//! events, plus spans and the instruments in [`metrics`], are also exported
//! under the configured service name, tagged with the host so signals from
//! several workers on one job can be told apart.

pub mod job;
pub mod metrics;

use crate::error::{Error, Result};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::OnceLock;

const DEFAULT_SERVICE_NAME: &str = "jobmonitor";

static SERVICE_NAME: OnceLock<String> = OnceLock::new();

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`. `None` keeps
    /// everything on stderr.
    pub endpoint: Option<String>,
    /// Names the service resource and the tracer/meter scope.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

/// The scope spans and instruments are recorded under.
///
/// Named after the service passed to [`init_telemetry`], or `jobmonitor`
/// before initialization.
pub fn scope() -> InstrumentationScope {
    instrumentation_scope(
        SERVICE_NAME
            .get()
            .map(String::as_str)
            .unwrap_or(DEFAULT_SERVICE_NAME),
    )
}

fn instrumentation_scope(service_name: &str) -> InstrumentationScope {
    InstrumentationScope::builder(service_name.to_string())
        .with_version(env!("CARGO_PKG_VERSION"))
        .build()
}

fn resource(service_name: &str) -> Resource {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    Resource::builder()
        .with_service_name(service_name.to_string())
        .with_attributes([
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("host.name", host),
            KeyValue::new("process.pid", i64::from(std::process::id())),
        ])
        .build()
}

/// The three OTLP export pipelines.
struct Exporters {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl Exporters {
    fn connect(endpoint: &str, resource: Resource) -> Result<Self> {
        use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig as _};

        let spans = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("span"))?;
        let samples = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let records = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("log"))?;

        Ok(Self {
            traces: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            metrics: SdkMeterProvider::builder()
                .with_periodic_exporter(samples)
                .with_resource(resource.clone())
                .build(),
            logs: SdkLoggerProvider::builder()
                .with_batch_exporter(records)
                .with_resource(resource)
                .build(),
        })
    }
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

/// Keeps the export pipelines alive. Dropping it flushes and shuts them
/// down, so hold it until the worker exits.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Push everything buffered so far to the collector.
    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            let _ = exporters.traces.force_flush();
            let _ = exporters.metrics.force_flush();
            let _ = exporters.logs.force_flush();
        }
    }

    /// Whether signals are leaving the process.
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            let _ = exporters.logs.shutdown();
            let _ = exporters.metrics.shutdown();
            let _ = exporters.traces.shutdown();
        }
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP pipelines.
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

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let service_name = SERVICE_NAME.get_or_init(|| config.service_name.clone());

    let exporters = config
        .endpoint
        .as_deref()
        .map(|endpoint| Exporters::connect(endpoint, resource(service_name)))
        .transpose()?;

    let trace_layer = exporters.as_ref().map(|e| {
        let tracer = e
            .traces
            .tracer_with_scope(instrumentation_scope(service_name));
        tracing_opentelemetry::layer().with_tracer(tracer)
    });
    let log_layer = exporters
        .as_ref()
        .map(|e| opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&e.logs));
    if let Some(e) = &exporters {
        opentelemetry::global::set_meter_provider(e.metrics.clone());
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { exporters })
}
