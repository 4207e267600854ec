//! Tracing subscriber initialisation.
//!
//! Binaries call [`init_tracing`] once at startup. Tests use
//! [`try_init_tracing`], which tolerates a subscriber that is already set.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter directive when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "vellum=info";

/// Install a global `fmt` subscriber filtered by `RUST_LOG`.
///
/// Falls back to `default_filter` when `RUST_LOG` is unset or invalid.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_tracing(default_filter: &str) {
    if let Err(e) = try_init_tracing(default_filter) {
        panic!("failed to set tracing subscriber: {e}");
    }
}

/// Like [`init_tracing`] but returns an error instead of panicking when a
/// global subscriber already exists.
pub fn try_init_tracing(default_filter: &str) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}
