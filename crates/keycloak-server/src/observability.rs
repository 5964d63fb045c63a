//! Tracing setup.
//!
//! The subscriber is installed once with a reloadable filter so the level
//! from the loaded configuration can replace the startup default.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

fn rust_log_set() -> bool {
    std::env::var_os("RUST_LOG").is_some()
}

fn startup_filter(level: &str) -> EnvFilter {
    if rust_log_set()
        && let Ok(filter) = EnvFilter::try_from_default_env()
    {
        return filter;
    }
    EnvFilter::new(level)
}

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_tracing_with_level(level: &str) {
    let (filter, handle) = reload::Layer::new(startup_filter(level));
    if FILTER_HANDLE.set(handle).is_err() {
        return;
    }
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switches to `level` unless `RUST_LOG` is set. Returns whether the filter
/// changed.
pub fn apply_logging_level(level: &str) -> bool {
    if rust_log_set() {
        return false;
    }
    match FILTER_HANDLE.get() {
        Some(handle) => handle.modify(|f| *f = EnvFilter::new(level)).is_ok(),
        None => false,
    }
}
