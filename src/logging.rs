//! Logging setup for the provider process.
//!
//! Logs go to **stderr**: stdout carries the handshake line the host parses
//! when it spawns the plugin.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: log filter (e.g. `info`, `terraform_provider_drp=debug`)
//!
//! ```bash
//! # Trace every DRP request and poll attempt
//! RUST_LOG=terraform_provider_drp=debug ./terraform-provider-drp
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

fn filter_or(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
}

/// Install the global subscriber, reading `RUST_LOG` and defaulting to `info`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_FILTER);
}

/// Like [`init_logging`], with a caller-chosen default filter.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter_or(default_level))
        .with(stderr_layer())
        .init();
}

/// Try to install the global subscriber; returns `false` if one already exists.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(filter_or(DEFAULT_FILTER))
        .with(stderr_layer())
        .try_init()
        .is_ok()
}
