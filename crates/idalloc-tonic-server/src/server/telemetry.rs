//! # Telemetry Features
//!
//! Console logging through `tracing_subscriber::fmt` is always on and filtered
//! by `RUST_LOG` (default `info`). Everything else is optional and exported via
//! OpenTelemetry.
//!
//! ## Feature matrix
//!
//! - `tracing`: Enables OpenTelemetry distributed tracing (via spans), and the
//!   allocator's own refill spans.
//! - `metrics`: Enables OpenTelemetry metrics (via counters and histograms).
//! - `otlp`: Enables the OTLP exporter, configured through the standard
//!   `OTEL_EXPORTER_OTLP_*` environment variables.
//! - `stdout`: Enables the stdout exporter.
//!
//! ## Feature constraints
//!
//! - Exporters require using at least one of: `tracing` or `metrics`.
//! - Both `otlp` and `stdout` exporters can be enabled at the same time.
//!
//! ## Metrics
//!
//! - `requests`: every `NextId` / `NextIds` call
//! - `ids_issued`: ids returned to clients
//! - `allocation_errors`: calls that returned an error
//! - `allocation_duration`: end-to-end allocation time in milliseconds
//!
//! ## Example usage
//!
//! Enable tracing and metrics, exported to an OTLP collector:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 cargo run --features tracing,metrics,otlp
//! ```
//!
//! Enable only local stdout export (no remote backend):
//!
//! ```bash
//! cargo run --features tracing,stdout
//! ```

// Disallow using `otlp` without `tracing` or `metrics`
#[cfg(all(feature = "otlp", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'tracing' or 'metrics' to be enabled.");

// Disallow using `stdout` without `tracing` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

// Core imports - always needed
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

// Metrics-specific imports
#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

// Either
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

// Tracing-specific imports
#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder("idalloc")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Console output, unrelated to the `opentelemetry_stdout` exporter.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("idalloc")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        builder.with_span_processor(batch_processor(SpanExporter::default()))
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .context("failed to build tracer exporter")?;

        builder.with_span_processor(batch_processor(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "otlp")))]
fn batch_processor<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static IDS_ISSUED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ALLOCATION_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ALLOCATION_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("requests")
            .with_description("Total id allocation requests")
            .build(),
    );

    let _ = IDS_ISSUED.set(
        meter
            .u64_counter("ids_issued")
            .with_description("Total ids returned to clients")
            .build(),
    );

    let _ = ALLOCATION_ERRORS.set(
        meter
            .u64_counter("allocation_errors")
            .with_description("Requests that failed")
            .build(),
    );

    let _ = ALLOCATION_DURATION_MS.set(
        meter
            .f64_histogram("allocation_duration")
            .with_unit("ms")
            .with_description("End-to-end allocation duration")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_requests(method: &'static str) {
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &[KeyValue::new("method", method)]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests(_method: &'static str) {}

#[cfg(feature = "metrics")]
pub fn increment_ids_issued(count: u64) {
    if let Some(counter) = IDS_ISSUED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_ids_issued(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_allocation_errors(code: tonic::Code) {
    if let Some(counter) = ALLOCATION_ERRORS.get() {
        counter.add(1, &[KeyValue::new("code", format!("{code:?}"))]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_allocation_errors(_code: tonic::Code) {}

#[cfg(feature = "metrics")]
pub fn record_allocation_duration(duration_ms: f64) {
    if let Some(histogram) = ALLOCATION_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_allocation_duration(_duration_ms: f64) {}
