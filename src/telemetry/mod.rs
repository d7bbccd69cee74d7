//! Logging, metrics and trace export setup.
//!
//! Logs always go to stdout, as JSON lines or compact text. With an OTLP
//! endpoint configured, tracing spans, logs, the `farm.*` metrics and the
//! reconstructed run traces are exported there as well; without one, run
//! traces go to the no-op global tracer and are dropped.

pub mod export;
pub mod metrics;
pub mod poll;

pub use export::OtelTraceSink;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::error::{Error, Result};

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint (`OTEL_ENDPOINT`), e.g. `http://localhost:4317`.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON lines instead of compact text.
    pub json_logs: bool,
}

/// The three OTLP pipelines, present only when an endpoint is configured.
struct Otlp {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl Otlp {
    fn connect(endpoint: &str, service_name: String) -> Result<Self> {
        let resource = Resource::builder().with_service_name(service_name).build();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let traces = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let instruments = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let metrics = SdkMeterProvider::builder()
            .with_periodic_exporter(instruments)
            .with_resource(resource.clone())
            .build();

        let records = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;
        let logs = SdkLoggerProvider::builder()
            .with_batch_exporter(records)
            .with_resource(resource)
            .build();

        // OtelTraceSink renders run traces through the global provider.
        opentelemetry::global::set_tracer_provider(traces.clone());
        opentelemetry::global::set_meter_provider(metrics.clone());

        Ok(Self {
            traces,
            metrics,
            logs,
        })
    }
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("OTLP {signal} exporter: {e}"))
}

/// Keeps the OTLP pipelines alive; flushes and shuts them down on drop.
pub struct TelemetryGuard {
    otlp: Option<Otlp>,
}

impl TelemetryGuard {
    /// True when run traces leave the process.
    pub fn exports_traces(&self) -> bool {
        self.otlp.is_some()
    }

    /// Push out buffered spans, metrics and logs, e.g. before shutdown.
    pub fn force_flush(&self) {
        if let Some(otlp) = &self.otlp {
            let _ = otlp.traces.force_flush();
            let _ = otlp.metrics.force_flush();
            let _ = otlp.logs.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(otlp) = self.otlp.take() {
            let _ = otlp.logs.shutdown();
            let _ = otlp.metrics.shutdown();
            let _ = otlp.traces.shutdown();
        }
    }
}

/// Install the global tracing subscriber and, with an endpoint, the OTLP
/// pipelines.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let json = config.json_logs.then(|| tracing_subscriber::fmt::layer().json());
    let text = (!config.json_logs).then(|| tracing_subscriber::fmt::layer().compact());

    let otlp = config
        .endpoint
        .as_deref()
        .map(|endpoint| Otlp::connect(endpoint, config.service_name.clone()))
        .transpose()?;

    let span_layer = otlp
        .as_ref()
        .map(|o| tracing_opentelemetry::layer().with_tracer(o.traces.tracer("farm")));
    let log_layer = otlp
        .as_ref()
        .map(|o| opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&o.logs));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .with(span_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { otlp })
}
