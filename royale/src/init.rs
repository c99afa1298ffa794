//! Tracing initialization for the coordinator binary.
//!
//! The numeric CLI level maps onto a tracing filter; an explicit
//! `RUST_LOG` in the environment wins over the flag.

use tracing_subscriber::EnvFilter;

pub fn tracing(level: i32) {
    let directive = match level.clamp(0, 6) {
        0 => "off",
        1 | 2 => "error",
        3 => "warn",
        4 => "info",
        5 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
