//! Tracing initialization helper.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global tracing subscriber with the given filter
/// directive (e.g. `"ryw=debug"`).
///
/// Falls back to `info` if the directive does not parse, and is a no-op
/// if a subscriber is already installed, so test suites can call it from
/// every helper.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
