//! Logging initialization and span helpers.
//!
//! Components log through `tracing`; binaries call [`init_logging`] once at startup.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for deployed environments).
    Json,
    /// Pretty-printed logs (for local runs).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `imms_batch=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for work on one bulk file.
///
/// # Example
///
/// ```rust
/// use imms_core::observability::ingest_span;
///
/// let span = ingest_span("process_rows", "COVID_Vaccinations_v5_ABC12_20240101T120000.csv");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn ingest_span(operation: &str, file_key: &str) -> Span {
    tracing::info_span!("ingest", op = operation, file_key = file_key)
}

/// Creates a span for a record store operation.
#[must_use]
pub fn record_span(operation: &str, record_id: &str) -> Span {
    tracing::info_span!("record", op = operation, record_id = record_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn test_span_helpers_create_spans() {
        let span = ingest_span("admit", "file.csv");
        let _guard = span.enter();
        let inner = record_span("update", "abc");
        let _inner = inner.enter();
        tracing::info!("message in nested spans");
    }
}
