use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Initialize structured JSON logging.
///
/// `RUST_LOG` takes precedence; otherwise `default_level` (from
/// `general.log_level`) is used. Calling this twice is harmless: the second
/// subscriber is simply not installed.
pub fn init_telemetry(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("Telemetry initialized with structured logging");
    }
}

/// Generate a correlation ID for linking the operations of one run
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping every provider call of a single run
pub fn create_run_span(run_id: &str, resource_name: &str, backend: &str) -> tracing::Span {
    tracing::info_span!(
        "harness_run",
        correlation.id = run_id,
        resource.name = resource_name,
        backend = backend,
    )
}
