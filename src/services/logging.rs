//! Structured logging setup.
//!
//! One registry: an `EnvFilter` (default `transcoder_core=info,tower_http=info`,
//! overridable via `RUST_LOG`) plus a JSON-formatted fmt layer. No database
//! persistence or broadcast subscription — logs go to stdout for the
//! operator's log aggregator to pick up.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global tracing subscriber. Must be called exactly once,
/// before any other component logs.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("transcoder_core=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true).with_current_span(true))
        .init();
}
