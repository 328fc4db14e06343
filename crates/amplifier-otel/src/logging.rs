//! Diagnostic logging for the engine itself.
//!
//! This is the crate's own `tracing` output (recoveries, drops, export
//! failures), not the telemetry it produces about kernel sessions.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable selecting JSON log output.
pub const LOG_JSON_ENV_VAR: &str = "AMPLIFIER_OTEL_LOG_JSON";

/// Installs a global subscriber.
///
/// Environment variables:
/// - `RUST_LOG`: log filter (default: `info`)
/// - `AMPLIFIER_OTEL_LOG_JSON`: `1` or `true` for JSON lines
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = std::env::var(LOG_JSON_ENV_VAR)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_current_span(true),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::debug!(json = use_json, "diagnostic logging initialized");
    }
    installed
}

/// Test-writer subscriber at `debug`; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
