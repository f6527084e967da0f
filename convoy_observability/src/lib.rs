//! Logging, tracing and metrics setup shared by the convoy crates.
//!
//! Logs go to stdout, as compact lines or as JSON when `RUST_LOG_FORMAT=json`.
//! Spans and metrics are exported over OTLP only when `OTEL_SDK_DISABLED=false`.
//! Metrics are always readable in-process through [`MetricsRecorder`].

use std::borrow::Cow;
use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{InstrumentationScope, global};
use opentelemetry_otlp::{ExporterBuildError, MetricExporter, SpanExporter};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use snafu::{ResultExt, Snafu};
use tracing::{Subscriber, warn};
use tracing_opentelemetry::MetricsLayer;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::{prelude::*, registry::LookupSpan};

pub use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

pub use crate::metrics::{MetricsRecorder, MetricsSnapshot};

mod metrics;

const OTEL_SDK_DISABLED: &str = "OTEL_SDK_DISABLED";
const RUST_LOG_FORMAT: &str = "RUST_LOG_FORMAT";
const OTLP_METRICS_INTERVAL: Duration = Duration::from_secs(10);

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum ObservabilityError {
    #[snafu(display("Failed to build exporter"))]
    Exporter { source: ExporterBuildError },
    #[snafu(display("Failed to install the tracing subscriber"))]
    Subscriber {
        source: tracing_subscriber::util::TryInitError,
    },
    #[snafu(display("Failed to collect metrics"))]
    Collect { source: OTelSdkError },
}

/// Providers installed by [`init_observability`].
///
/// Dropping it without [`Telemetry::shutdown`] may lose the last OTLP batch.
pub struct Telemetry {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

pub fn meter(name: &'static str) -> Meter {
    global::meter(name)
}

/// Install the global subscriber and meter provider.
///
/// `recorder` is registered alongside the OTLP reader so the caller can keep
/// a clone and take snapshots.
pub fn init_observability(
    service_name: impl Into<Cow<'static, str>>,
    service_version: impl Into<Cow<'static, str>>,
    recorder: MetricsRecorder,
) -> Result<Telemetry, ObservabilityError> {
    let service_name = service_name.into();
    let service_version = service_version.into();
    let export = otlp_export_enabled();

    let resource = Resource::builder()
        .with_service_name(service_name.clone())
        .with_attribute(KeyValue::new("service.version", service_version.clone()))
        .build();

    let tracer_provider = tracer_provider(resource.clone(), export)?;
    let meter_provider = meter_provider(resource, recorder, export)?;
    global::set_meter_provider(meter_provider.clone());

    let scope = InstrumentationScope::builder(service_name)
        .with_version(service_version)
        .build();

    tracing_subscriber::registry()
        .with(vec![
            log_layer(),
            otel_layer(&tracer_provider, scope, meter_provider.clone()),
        ])
        .try_init()
        .context(SubscriberSnafu {})?;

    Ok(Telemetry {
        tracer_provider,
        meter_provider,
    })
}

impl Telemetry {
    /// Flush pending spans and metrics and stop the exporters.
    ///
    /// A [`MetricsRecorder`] returns errors once this ran.
    pub fn shutdown(self) {
        if let Err(err) = self.tracer_provider.shutdown() {
            warn!(err = %err, "failed to shut down tracer provider");
        }
        if let Err(err) = self.meter_provider.shutdown() {
            warn!(err = %err, "failed to shut down meter provider");
        }
    }
}

// Exporting is opt-in: the variable must be explicitly set to "false".
fn otlp_export_enabled() -> bool {
    std::env::var(OTEL_SDK_DISABLED)
        .map(|v| v == "false")
        .unwrap_or(false)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO"))
}

fn log_layer<S>() -> BoxedLayer<S>
where
    S: Subscriber,
    for<'a> S: LookupSpan<'a>,
{
    let json = std::env::var(RUST_LOG_FORMAT)
        .map(|val| val == "json")
        .unwrap_or(false);

    let layer = tracing_subscriber::fmt::layer();
    if json {
        layer
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(env_filter())
            .boxed()
    } else {
        layer
            .with_target(false)
            .compact()
            .with_filter(env_filter())
            .boxed()
    }
}

fn otel_layer<S>(
    tracer_provider: &SdkTracerProvider,
    scope: InstrumentationScope,
    meter_provider: SdkMeterProvider,
) -> BoxedLayer<S>
where
    S: Subscriber + Send + Sync,
    for<'a> S: LookupSpan<'a>,
{
    let tracer = tracer_provider.tracer_with_scope(scope);
    env_filter()
        .and_then(MetricsLayer::new(meter_provider))
        .and_then(tracing_opentelemetry::layer().with_tracer(tracer))
        .boxed()
}

fn tracer_provider(
    resource: Resource,
    export: bool,
) -> Result<SdkTracerProvider, ObservabilityError> {
    let builder = SdkTracerProvider::builder().with_resource(resource);
    if !export {
        return Ok(builder.build());
    }

    let exporter = SpanExporter::builder()
        .with_tonic()
        .build()
        .context(ExporterSnafu {})?;
    Ok(builder.with_batch_exporter(exporter).build())
}

fn meter_provider(
    resource: Resource,
    recorder: MetricsRecorder,
    export: bool,
) -> Result<SdkMeterProvider, ObservabilityError> {
    let builder = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(recorder);
    if !export {
        return Ok(builder.build());
    }

    let exporter = MetricExporter::builder()
        .with_tonic()
        .build()
        .context(ExporterSnafu {})?;
    let reader = PeriodicReader::builder(exporter)
        .with_interval(OTLP_METRICS_INTERVAL)
        .build();
    Ok(builder.with_reader(reader).build())
}
