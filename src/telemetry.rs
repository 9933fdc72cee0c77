//! Process-wide tracing setup for binaries embedding this crate: an
//! `EnvFilter` layer, a plain `fmt` layer, and `tracing_error`'s
//! `ErrorLayer` so `miette` reports can capture a `SpanTrace` alongside the
//! error chain.
//!
//! The scheduler itself never calls this — it only emits `tracing` spans
//! and events. Wiring a subscriber is left to the embedding application, but
//! [`init_tracing`] is provided so that application doesn't have to
//! reconstruct the layer stack from scratch.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global `tracing` subscriber: `RUST_LOG`-driven filtering
/// (falling back to `error,workweave=info`), compact formatting, and a
/// `SpanTrace`-capturing error layer. Panics if a global subscriber is
/// already set, matching `tracing_subscriber::util::SubscriberInitExt::init`.
pub fn init_tracing() {
    let fmt_layer = fmt::layer().with_target(false).with_file(false).with_line_number(false);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("error,workweave=info"))
        .expect("static fallback filter directive is always valid");

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Install `miette`'s panic hook for prettier panic reports.
pub fn init_miette_panic_hook() {
    miette::set_panic_hook();
}
