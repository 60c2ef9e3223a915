//! Observability bootstrap (SPEC_FULL §10.1).
//!
//! Every public entry point on the Stepper, activity runner, and Dispatcher
//! already carries a `#[tracing::instrument]` span; this module is the
//! opt-in plumbing that turns those spans into OpenTelemetry-shaped output,
//! mirroring the `init_telemetry` helper this codebase's `core` crate keeps
//! for the same purpose. It is deliberately not wired into every binary —
//! an embedding application calls it from its own `main` if it wants it.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keep this alive for the process lifetime; dropping it shuts the tracer
/// provider down.
pub struct TracingGuard {
    provider: SdkTracerProvider,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            eprintln!("failed to shut down tracer provider: {err}");
        }
    }
}

/// Install a `tracing_subscriber` registry combining an `EnvFilter` (via
/// `RUST_LOG`, defaulting to `info`), a console fmt layer, and an
/// OpenTelemetry layer.
///
/// No exporter is attached to the returned provider — spans are sampled and
/// enriched but not shipped anywhere by default, matching this codebase's
/// habit of keeping observability plumbing opt-in rather than forcing an
/// exporter dependency on every call site. An embedding binary that wants
/// real export builds its own `SdkTracerProvider` with a batch exporter
/// instead of calling this.
pub fn init_tracing(service_name: &str) -> TracingGuard {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let resource = Resource::builder()
        .with_attributes(vec![KeyValue::new("service.name", service_name.to_string())])
        .build();
    let provider = SdkTracerProvider::builder().with_resource(resource).build();
    let tracer = provider.tracer(service_name.to_string());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    TracingGuard { provider }
}
