//! Tracing setup with optional OpenTelemetry export
//!
//! Without telemetry the process logs through `common::logging`. With it,
//! spans are additionally exported over OTLP/gRPC.

use crate::config::{LogFormat, LoggingSettings, TelemetrySettings};
use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// OpenTelemetry tracer guard
///
/// When dropped, flushes all pending spans and shuts down the tracer
pub struct TelemetryGuard;

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Install the OTLP exporter and return a tracer for the tracing layer
pub fn init_telemetry(settings: &TelemetrySettings) -> Result<Tracer, Box<dyn std::error::Error + Send + Sync>> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(settings.otlp_endpoint.as_str())
        .build()?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", settings.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build();

    let tracer = provider.tracer(settings.service_name.clone());
    opentelemetry::global::set_tracer_provider(provider);
    Ok(tracer)
}

/// Initialize the global subscriber.
///
/// Must be called from within a tokio runtime when telemetry is enabled.
/// Keep the returned guard alive for the life of the process.
pub fn setup_tracing(
    logging: &LoggingSettings,
    telemetry: &TelemetrySettings,
) -> Result<Option<TelemetryGuard>, Box<dyn std::error::Error + Send + Sync>> {
    if !telemetry.enabled {
        match logging.format {
            LogFormat::Text => common::logging::init(logging.level()),
            LogFormat::Json => common::logging::init_json(logging.level()),
        }
        tracing::info!("Tracing initialized without OpenTelemetry");
        return Ok(None);
    }

    let tracer = init_telemetry(telemetry)?;
    let base = tracing_subscriber::registry()
        .with(common::logging::env_filter(logging.level()))
        .with(tracing_opentelemetry::layer().with_tracer(tracer));

    match logging.format {
        LogFormat::Text => base.with(fmt::layer()).init(),
        LogFormat::Json => base.with(fmt::layer().json()).init(),
    }

    tracing::info!(
        service_name = %telemetry.service_name,
        otlp_endpoint = %telemetry.otlp_endpoint,
        "Tracing initialized with OpenTelemetry integration"
    );
    Ok(Some(TelemetryGuard))
}
