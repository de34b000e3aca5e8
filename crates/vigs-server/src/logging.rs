//! `tracing` subscriber bootstrap.
//!
//! `RUST_LOG` wins when set. Otherwise the numeric `VIGS_DEBUG` level picks a global filter
//! (0 off, 1 error, 2 warn, 3 info, 4 debug, 5 trace; out-of-range values clamp). Without
//! either, logging is off.

use std::env;

use tracing_subscriber::EnvFilter;

pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

const LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Filter directive for a `VIGS_DEBUG` value. Unparsable values mean off.
pub fn vigs_debug_directive(value: &str) -> &'static str {
    let level = value.trim().parse::<i64>().unwrap_or(0);
    let idx = level.clamp(0, LEVELS.len() as i64 - 1) as usize;
    LEVELS[idx]
}

pub fn env_filter(rust_log: Option<&str>, vigs_debug: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log {
        return EnvFilter::new(directives);
    }
    EnvFilter::new(vigs_debug.map_or("off", vigs_debug_directive))
}

/// Installs the global fmt subscriber. Fails if one is already installed.
pub fn init() -> Result<(), InitError> {
    let rust_log = env::var("RUST_LOG").ok();
    let vigs_debug = env::var("VIGS_DEBUG").ok();
    let filter = env_filter(rust_log.as_deref(), vigs_debug.as_deref());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
}
