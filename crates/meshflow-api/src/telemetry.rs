//! Structured logging setup. Console-only `tracing-subscriber` with an
//! `EnvFilter` driven by `RUST_LOG`/`LOG_LEVEL` — no OTLP exporter here,
//! since nothing downstream of this crate consumes spans over the wire.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    fmt().with_env_filter(filter).with_target(true).init();
}
