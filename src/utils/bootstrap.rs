//! Bootstrap utilities for applications embedding the event store.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

/// Log filter from `EVENT_STORE_LOG`, or `default` directives when it is
/// unset or unparsable.
pub fn log_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global tracing subscriber, filtered by `EVENT_STORE_LOG`
/// (default "info").
///
/// Returns `false` if the embedding application already installed one.
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(log_filter("info"))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Like `init_tracing`, but writes through the test harness capture.
pub fn try_init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(log_filter("info"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
