//! Tracing helpers: the current span's trace id for log correlation, and
//! (behind the `telemetry` feature) the OTLP tracer pipeline.

use opentelemetry::trace::TraceId;

/// Fetch the current span's `TraceId` as hex through the entire stack.
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current().context().span().span_context().trace_id()
}

/// Builds the OTLP (gRPC, via `tonic`) tracer pipeline this binary installs
/// as a `tracing_opentelemetry` layer when built with `--features telemetry`.
/// Endpoint is read from the standard `OTEL_EXPORTER_OTLP_ENDPOINT` env var,
/// defaulting to the collector sidecar convention.
#[cfg(feature = "telemetry")]
pub fn init_tracer() -> opentelemetry::sdk::trace::Tracer {
    use opentelemetry::sdk::{trace, Resource};
    use opentelemetry::KeyValue;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
        .with_trace_config(
            trace::config().with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                "kubechecks-core",
            )])),
        )
        .install_batch(opentelemetry::runtime::Tokio)
        .expect("failed installing otlp tracer pipeline")
}
