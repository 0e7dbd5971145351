//! Logging setup shared by the operator and relay binaries.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Install the global tracing subscriber.
///
/// Defaults to INFO; override per-target via `RUST_LOG`.
pub fn init() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer().with_writer(std::io::stderr).with_target(true);

    registry().with(fmt_layer.with_filter(env_filter)).init();
}
