use std::sync::OnceLock;

use opentelemetry::metrics::Counter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, SpanExporter};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::Error;

pub fn init_observability(otlp_enabled: bool) -> Result<Observability, Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env()
        .map_err(|error| Error::Config(error.to_string()))?;

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    if !otlp_enabled {
        registry.init();
        return Ok(Observability::default());
    }

    let tracer_provider = init_tracer_provider()?;
    let meter_provider = init_meter_provider()?;

    opentelemetry::global::set_meter_provider(meter_provider.clone());

    let tracer = tracer_provider.tracer(env!("CARGO_PKG_NAME"));

    registry.with(OpenTelemetryLayer::new(tracer)).init();

    Ok(Observability {
        tracer_provider: Some(tracer_provider),
        meter_provider: Some(meter_provider),
    })
}

#[derive(Default)]
pub struct Observability {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for Observability {
    fn drop(&mut self) {
        if let Some(tracer_provider) = &self.tracer_provider {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }

        if let Some(meter_provider) = &self.meter_provider {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}

fn init_tracer_provider() -> Result<SdkTracerProvider, Error> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .build()
        .map_err(|error| Error::Config(error.to_string()))?;

    Ok(SdkTracerProvider::builder()
        .with_resource(resource())
        .with_batch_exporter(exporter)
        .build())
}

fn init_meter_provider() -> Result<SdkMeterProvider, Error> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .build()
        .map_err(|error| Error::Config(error.to_string()))?;

    Ok(SdkMeterProvider::builder()
        .with_resource(resource())
        .with_periodic_exporter(exporter)
        .build())
}

fn resource() -> Resource {
    Resource::builder()
        .with_attribute(KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")))
        .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
        .build()
}

struct Counters {
    skipped_public_keys: Counter<u64>,
    storage_sign_failures: Counter<u64>,
}

static COUNTERS: OnceLock<Counters> = OnceLock::new();

fn counters() -> &'static Counters {
    COUNTERS.get_or_init(|| {
        let meter = opentelemetry::global::meter(env!("CARGO_PKG_NAME"));

        Counters {
            skipped_public_keys: meter
                .u64_counter("lfs_gateway.public_keys.skipped")
                .with_description("Public keys skipped because they could not be parsed")
                .build(),
            storage_sign_failures: meter
                .u64_counter("lfs_gateway.storage.sign_failures")
                .with_description("Batch objects returned without a signed URL")
                .build(),
        }
    })
}

pub fn record_skipped_public_key(source: &'static str) {
    counters()
        .skipped_public_keys
        .add(1, &[KeyValue::new("source", source)]);
}

pub fn record_storage_sign_failure(repository: &str, operation: &'static str) {
    counters().storage_sign_failures.add(
        1,
        &[
            KeyValue::new("repository", repository.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
