//! Log and OpenTelemetry wiring for the engine process.
//!
//! Every process writes human-readable logs to stderr. When an OTLP
//! collector is configured, spans, engine metrics and log records are also
//! exported, tagged with the engine's environment and organization.

pub mod execution;
pub mod metrics;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

const INSTRUMENTATION_SCOPE: &str = "jobrun";

pub struct TelemetryConfig {
    /// OTLP collector, e.g. "http://localhost:4317". Stderr only when unset.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Used when `RUST_LOG` is unset.
    pub log_level: String,
    pub environment: String,
    pub organization: String,
}

impl TelemetryConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: "jobrun".to_string(),
            log_level: config.log_level.clone(),
            environment: config.engine.environment.clone(),
            organization: config.engine.organization.clone(),
        }
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes([
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                    env!("CARGO_PKG_VERSION"),
                ),
                KeyValue::new("deployment.environment.name", self.environment.clone()),
                KeyValue::new("jobrun.organization", self.organization.clone()),
            ])
            .build()
    }
}

/// Exporting providers, flushed and shut down when dropped.
///
/// Hold it until the process exits; an engine-only setup holds nothing.
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
    /// Push anything buffered to the collector now.
    pub fn force_flush(&self) {
        let Some(exporters) = &self.exporters else {
            return;
        };
        if let Err(e) = exporters.traces.force_flush() {
            tracing::warn!(error = %e, "span flush failed");
        }
        if let Err(e) = exporters.metrics.force_flush() {
            tracing::warn!(error = %e, "metric flush failed");
        }
        if let Err(e) = exporters.logs.force_flush() {
            tracing::warn!(error = %e, "log flush failed");
        }
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

/// Install the global tracing subscriber, exporting to OTLP when
/// `config.endpoint` is set. Also installs the global meter provider the
/// engine's counters and histograms record into.
///
/// # Errors
///
/// Fails when an exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard::default());
    };

    let exporters = Exporters::connect(endpoint, config.resource())?;
    opentelemetry::global::set_meter_provider(exporters.metrics.clone());

    let spans = {
        use opentelemetry::trace::TracerProvider as _;
        tracing_opentelemetry::layer().with_tracer(exporters.traces.tracer(INSTRUMENTATION_SCOPE))
    };
    let records =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&exporters.logs);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(spans)
        .with(records)
        .try_init()
        .map_err(subscriber_error)?;

    tracing::info!(endpoint, "exporting telemetry");
    Ok(TelemetryGuard {
        exporters: Some(exporters),
    })
}

impl Exporters {
    fn connect(endpoint: &str, resource: Resource) -> Result<Self> {
        use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig as _};

        let spans = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let metrics = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let logs = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;

        Ok(Self {
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
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to build OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to install tracing subscriber: {e}"))
}
