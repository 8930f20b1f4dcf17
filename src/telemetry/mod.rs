//! Logging and OpenTelemetry export for taskq processes.
//!
//! Every process logs through `tracing`. When an OTLP endpoint is set,
//! spans, metrics, and log records are exported too, tagged with the
//! process role, the queue it serves, and a per-process instance id so
//! several workers on one queue can be told apart.

pub mod metrics;
pub mod task;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};

/// What a taskq process does. Becomes part of the service name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Worker,
    Dispatcher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Dispatcher => "dispatcher",
            Role::Admin => "admin",
        }
    }
}

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint (e.g. "http://localhost:4317"). `None` logs to
    /// stderr only.
    pub endpoint: Option<String>,
    pub role: Role,
    pub queue: String,
    pub instance_id: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub default_level: String,
}

impl TelemetryConfig {
    /// Telemetry settings for a process of `role`, with a fresh instance id.
    pub fn from_config(config: &Config, role: Role) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            role,
            queue: config.queue.clone(),
            instance_id: Uuid::new_v4().to_string(),
            default_level: config.log_level.clone(),
        }
    }

    pub fn service_name(&self) -> String {
        format!("taskq-{}", self.role.as_str())
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name())
            .with_attributes([
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                KeyValue::new("service.instance.id", self.instance_id.clone()),
                KeyValue::new("taskq.role", self.role.as_str()),
                KeyValue::new("taskq.queue", self.queue.clone()),
            ])
            .build()
    }
}

/// Holds the OTel providers; flushes and shuts them down on drop.
/// Keep it alive for the whole process.
#[derive(Default)]
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Providers {
    fn otlp(endpoint: &str, resource: Resource) -> Result<Self> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_failed("span", e))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_failed("metric", e))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_failed("log", e))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }
}

impl TelemetryGuard {
    /// Push buffered telemetry out now instead of waiting for the batch.
    pub fn force_flush(&self) {
        if let Some(p) = &self.providers {
            let _ = p.tracer.force_flush();
            let _ = p.meter.force_flush();
            let _ = p.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.providers.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

/// Install the global subscriber (and OTLP pipelines, if configured).
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.as_str()));

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_failed)?;
        return Ok(TelemetryGuard::default());
    };

    let providers = Providers::otlp(endpoint, config.resource())?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());

    let tracer = providers.tracer.tracer("taskq-rs");
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
            &providers.logger,
        ))
        .try_init()
        .map_err(subscriber_failed)?;

    tracing::info!(
        service = %config.service_name(),
        instance = %config.instance_id,
        queue = %config.queue,
        "telemetry exporting to {endpoint}"
    );
    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}

fn exporter_failed(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn subscriber_failed(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}
