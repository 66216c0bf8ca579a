//! # Structured Logging Module
//!
//! Environment-aware `tracing` setup. Human-readable output on a terminal,
//! JSON lines otherwise or when `DISPATCH_LOG_FORMAT=json`. `RUST_LOG`
//! overrides the environment's default level.

use std::io::IsTerminal;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::models::RecordId;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = env_filter(&environment);
        let json = use_json_output();

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
            return;
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json,
            "Structured logging initialized"
        );
    });
}

/// Plain console logging for tools and tests
pub fn init_console_only() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = env_filter(&get_environment());
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_filter(filter))
            .try_init();
    });
}

fn get_environment() -> String {
    std::env::var("DISPATCH_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

fn env_filter(environment: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(get_log_level(environment)))
}

fn use_json_output() -> bool {
    match std::env::var("DISPATCH_LOG_FORMAT") {
        Ok(format) => format.eq_ignore_ascii_case("json"),
        Err(_) => !std::io::stdout().is_terminal(),
    }
}

/// Log a record lifecycle event with a consistent field set
pub fn log_record_operation(
    operation: &str,
    channel: &str,
    record_id: RecordId,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        channel = %channel,
        record_id = %record_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "RECORD_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_per_environment() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_console_only();
        init_structured_logging();
        init_console_only();
    }
}
