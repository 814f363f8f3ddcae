//! # Structured Logging
//!
//! Sets up the `tracing` subscriber: pretty or JSON output, filtered by
//! `RUST_LOG` when set. Output goes to stderr so `validate` and `backups`
//! can print reports on stdout.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "deedchain_node=info,deedchain=info,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, for local development.
    Pretty,
    /// One JSON object per line, for log aggregation.
    Json,
}

/// Install the global subscriber. Call once, early in `main()`.
///
/// A second call leaves the first subscriber in place.
pub fn init_logging(default_filter: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr).with_target(true))
            .try_init(),
    };

    if installed.is_ok() {
        tracing::debug!(?format, "logging initialized");
    }
}
