//! Logging for simulations.

use crate::LogLevel;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber printing events at `level` and above.
///
/// Only the first call in a process installs a subscriber; later calls have no effect.
pub fn init(level: LogLevel) {
    // Create fmt layer for logging
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_target(true)
        .with_test_writer();

    // Create a filter layer to set the maximum level
    let filter = EnvFilter::new(Level::from(level).to_string());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
