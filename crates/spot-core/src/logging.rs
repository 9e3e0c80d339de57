//! Logging initialization using the `tracing` ecosystem.
//!
//! Provides:
//! - Console output (colored, human-readable)
//! - File output (daily rotation via `tracing-appender`), as plain text or
//!   one JSON object per line for log shippers
//! - Configurable log level via env var `RUST_LOG` or explicit parameter

use serde::Deserialize;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Line format of the rolling log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Initialize the global tracing subscriber.
///
/// Should be called once at program start.
///
/// # Parameters
///
/// - `log_level`: default level if `RUST_LOG` env var is not set (e.g. `"info"`)
/// - `log_dir`: optional directory for daily-rotating log files
/// - `module_name`: used as the log file prefix (e.g. `"spot_relay"`)
/// - `format`: line format of the file output
pub fn init_logging(log_level: &str, log_dir: Option<&str>, module_name: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(true);

    let file_layer = log_dir.map(|dir| file_layer(dir, module_name, format));

    // The file layer sits directly on the registry so it can be boxed; the
    // env filter still applies to every layer.
    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter)
        .init();
}

fn file_layer(
    dir: &str,
    module_name: &str,
    format: LogFormat,
) -> Box<dyn Layer<Registry> + Send + Sync> {
    let file_appender = tracing_appender::rolling::daily(dir, module_name);
    let layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => layer.boxed(),
        // Span context is dropped: the relay logs with bracketed prefixes,
        // not spans.
        LogFormat::Json => layer
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .boxed(),
    }
}
