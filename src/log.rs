//! Installation of the `tracing` subscriber used by the demo driver.
//!
//! The library itself only emits events through the `tracing` macros. Messages
//! follow the `[id] (State) message` layout so one connection can be followed
//! through its state transitions.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a formatted subscriber filtered by `RUST_LOG`, or by
/// `default_filter` when the variable is unset or invalid.
///
/// Calling this more than once is harmless; only the first call installs a
/// subscriber.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
