// Tracing and OpenTelemetry setup
//
// Every pipeline binary initializes logging through this module:
// - Console output filtered by RUST_LOG / LOG_LEVEL
// - Optional OTLP span export when OTEL_EXPORTER_OTLP_ENDPOINT is set
// - Shared attribute names for pipeline tick spans

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_SERVICE_NAME: &str = "beacon-pipeline";

/// Attribute names recorded on pipeline tick spans and events
pub mod attrs {
    /// Loop name ("extract" or "match")
    pub const PROCESS: &str = "pipeline.process";
    /// First sequence id of the batch
    pub const RANGE_START: &str = "pipeline.range.start";
    /// Last sequence id of the batch
    pub const RANGE_END: &str = "pipeline.range.end";
    /// Rows read for the batch
    pub const ROWS_PROCESSED: &str = "pipeline.rows.processed";
    /// Rows that produced a resolved identity
    pub const ROWS_MATCHED: &str = "pipeline.rows.matched";
    /// Watermark after commit
    pub const WATERMARK: &str = "pipeline.watermark";
    /// Distance between the newest available id and the watermark
    pub const LAG: &str = "pipeline.lag";
    /// Attempt number within the transient-conflict retry
    pub const ATTEMPT: &str = "pipeline.attempt";
}

/// Configuration for tracing output
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP endpoint (e.g., "http://localhost:4317")
    pub otlp_endpoint: Option<String>,
    /// Deployment environment (e.g., "production")
    pub environment: Option<String>,
    pub enable_console: bool,
    /// Log filter (e.g., "info", "beacon_worker=debug")
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: None,
            otlp_endpoint: None,
            environment: None,
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OTEL_SERVICE_NAME`: Service name (default: "beacon-pipeline")
    /// - `OTEL_SERVICE_VERSION`: Service version
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint
    /// - `OTEL_ENVIRONMENT`: Deployment environment
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), DEFAULT_SERVICE_NAME, &[])
    }

    /// Like [`from_env`](Self::from_env), with a binary's own defaults
    ///
    /// `service_name` applies when `OTEL_SERVICE_NAME` is unset. A bare
    /// `LOG_LEVEL` is scoped to `targets`; `RUST_LOG` is used verbatim.
    pub fn from_env_with_defaults(service_name: &str, targets: &[&str]) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), service_name, targets)
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        service_name: &str,
        targets: &[&str],
    ) -> Self {
        let log_filter = lookup("RUST_LOG").or_else(|| {
            let level = lookup("LOG_LEVEL");
            if targets.is_empty() {
                return level;
            }
            let level = level.unwrap_or_else(|| "info".to_string());
            Some(
                targets
                    .iter()
                    .map(|target| format!("{target}={level}"))
                    .collect::<Vec<_>>()
                    .join(","),
            )
        });

        Self {
            service_name: lookup("OTEL_SERVICE_NAME").unwrap_or_else(|| service_name.to_string()),
            service_version: lookup("OTEL_SERVICE_VERSION"),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|v| !v.trim().is_empty()),
            environment: lookup("OTEL_ENVIRONMENT"),
            enable_console: true,
            log_filter,
        }
    }
}

/// Guard that shuts down the tracer provider when dropped
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {:?}", e);
            }
        }
    }
}

/// Initialize tracing with the given configuration
///
/// Keep the returned guard alive for the lifetime of the process so
/// buffered spans are flushed on exit.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let mut resource_attrs = vec![KeyValue::new("service.name", config.service_name.clone())];
    if let Some(version) = &config.service_version {
        resource_attrs.push(KeyValue::new("service.version", version.clone()));
    }
    if let Some(env) = &config.environment {
        resource_attrs.push(KeyValue::new("deployment.environment", env.clone()));
    }
    let resource = Resource::builder().with_attributes(resource_attrs).build();

    let filter = config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let console_layer = config.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
    });

    let (provider, otel_layer, otel_status) = match &config.otlp_endpoint {
        Some(endpoint) => match build_otlp_tracer(endpoint, resource) {
            Ok((provider, tracer)) => {
                let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
            }
            Err(e) => (None, None, Some(Err(e.to_string()))),
        },
        None => (None, None, None),
    };

    // try_init so tests that call this more than once do not panic
    let _ = tracing_subscriber::registry()
        .with(console_layer)
        .with(otel_layer)
        .try_init();

    match otel_status {
        Some(Ok(endpoint)) => {
            tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled");
        }
        Some(Err(e)) => {
            tracing::warn!(
                error = %e,
                "Failed to initialize OTLP tracer, continuing without export"
            );
        }
        None => {
            tracing::debug!("OpenTelemetry tracing disabled: OTEL_EXPORTER_OTLP_ENDPOINT not set");
        }
    }

    TelemetryGuard { provider }
}

fn build_otlp_tracer(
    endpoint: &str,
    resource: Resource,
) -> Result<
    (SdkTracerProvider, opentelemetry_sdk::trace::Tracer),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer(DEFAULT_SERVICE_NAME);
    Ok((provider, tracer))
}

/// Span name for one loop tick
///
/// Format: `tick {process}`
pub fn tick_span_name(process: &str) -> String {
    format!("tick {process}")
}
