//! # Structured Logging Module
//!
//! Environment-aware structured logging for debugging the async
//! orchestration workflows. Console output honours `RUST_LOG`; the JSON
//! layer is enabled for non-development environments.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// Safe to call from every test or binary entry point; subsequent calls
/// are no-ops.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(&environment));

        let console_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(environment == "development")
            .with_filter(filter);

        // A subscriber may already be installed by an embedding process;
        // that is not an error.
        let _ = tracing_subscriber::registry().with(console_layer).try_init();
    });
}

fn get_environment() -> String {
    std::env::var("OPFLOW_ENV")
        .or_else(|_| std::env::var("RUST_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn default_filter(environment: &str) -> EnvFilter {
    let directive = match environment {
        "production" => "opflow_core=info",
        "test" => "opflow_core=warn",
        _ => "opflow_core=debug",
    };
    EnvFilter::new(directive)
}
