use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{SdkTracerProvider, Tracer},
};

use crate::ServerError;

/// Installs the W3C trace-context propagator and builds a tracer exporting
/// spans over OTLP/gRPC.
///
/// The exporter endpoint follows the standard `OTEL_EXPORTER_OTLP_*`
/// environment variables.
pub(crate) fn init_tracer() -> Result<Tracer, ServerError> {
    global::set_text_map_propagator(TraceContextPropagator::new());
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .map_err(|err| ServerError::Telemetry(err.to_string()))?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build();
    Ok(tracer_provider.tracer("gear-server"))
}
