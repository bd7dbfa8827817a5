//! Tracing setup. The level from `[logging]` is applied after the config is
//! loaded through a reload handle; `RUST_LOG` always takes precedence.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

/// Builds the filter for `level`. Dependencies stay at `warn` unless the
/// level is stricter, so `debug` only widens rulestream's own output.
fn level_filter(level: &str) -> EnvFilter {
    let level = level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" => EnvFilter::new(format!(
            "warn,rulestream_server={level},rulestream_db_memory={level},tower_http={level}"
        )),
        _ => EnvFilter::new(level),
    }
}

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    let filter = match std::env::var_os("RUST_LOG") {
        Some(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(level)),
        None => level_filter(level),
    };

    let (filter, handle) = reload::Layer::new(filter);
    if FILTER.set(handle).is_err() {
        return;
    }
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switches to the configured level. No-op when `RUST_LOG` is set or tracing
/// was never initialized.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        tracing::debug!(level, "RUST_LOG is set, keeping its filter");
        return;
    }
    let Some(handle) = FILTER.get() else {
        return;
    };
    match handle.reload(level_filter(level)) {
        Ok(()) => tracing::info!(level, "Log level applied"),
        Err(e) => tracing::warn!(level, error = %e, "Failed to apply log level"),
    }
}
