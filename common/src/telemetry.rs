// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting and trace context
///
/// This function sets up the tracing subscriber with:
/// - JSON formatting for structured logs
/// - Trace context (trace_id, span_id) in all log entries
/// - Log levels from configuration or environment
/// - Optional OpenTelemetry integration
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    // Create environment filter from log level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    // Create JSON formatting layer with trace context
    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    // Initialize the subscriber with optional OpenTelemetry layer
    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        // Initialize OpenTelemetry if endpoint is provided
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
///
/// This function sets up OpenTelemetry tracing with:
/// - OTLP exporter to send traces to a collector (e.g., Jaeger)
/// - Service name and version as resource attributes
/// - Random ID generator for trace and span IDs
/// - Always-on sampler for all traces
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    // Create OTLP exporter
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    // Create tracer provider with resource attributes
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", "yard-dispatch-scheduler"),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    // Set global tracer provider
    global::set_tracer_provider(tracer_provider.clone());

    // Get tracer
    let tracer = tracer_provider.tracer("yard-dispatch-scheduler");

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Shutdown OpenTelemetry tracer provider
///
/// This should be called on graceful shutdown to flush remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter
///
/// Registers the dispatcher metrics:
/// - appointments_dispatched_total: appointments moved to in-service
/// - appointment_dispatch_noop_total: dispatches rejected by the status gate
/// - appointment_dispatch_failed_total: failed dispatches, labelled by step
/// - scheduler_ticks_skipped_total: ticks rejected by the single-flight guard
/// - scheduler_tick_duration_seconds: wall time of completed ticks
/// - scheduler_due_candidates: due appointments seen by the last tick
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "appointments_dispatched_total",
        "Total number of appointments dispatched to in-service"
    );
    describe_counter!(
        "appointment_dispatch_noop_total",
        "Dispatch attempts skipped because the appointment was no longer scheduled"
    );
    describe_counter!(
        "appointment_dispatch_failed_total",
        "Dispatch attempts that failed, by step"
    );
    describe_counter!(
        "scheduler_ticks_skipped_total",
        "Ticks rejected because another tick was still running"
    );
    describe_histogram!(
        "scheduler_tick_duration_seconds",
        "Duration of completed scheduler ticks in seconds"
    );
    describe_gauge!(
        "scheduler_due_candidates",
        "Due appointments found by the most recent tick"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_dispatched(kind: &str) {
    counter!("appointments_dispatched_total", "kind" => kind.to_string()).increment(1);
}

#[inline]
pub fn record_dispatch_noop() {
    counter!("appointment_dispatch_noop_total").increment(1);
}

#[inline]
pub fn record_dispatch_failure(step: &'static str) {
    counter!("appointment_dispatch_failed_total", "step" => step).increment(1);
}

#[inline]
pub fn record_tick_skipped() {
    counter!("scheduler_ticks_skipped_total").increment(1);
}

#[inline]
pub fn record_tick_duration(duration_seconds: f64) {
    histogram!("scheduler_tick_duration_seconds").record(duration_seconds);
}

#[inline]
pub fn update_due_candidates(count: usize) {
    gauge!("scheduler_due_candidates").set(count as f64);
}
