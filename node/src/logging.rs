//! Logging setup (§7): `tracing-subscriber` with `RUST_LOG`/`--debug`
//! fallback, the way the rest of the pack wires up a service's logging.

use tracing_subscriber::EnvFilter;

pub fn init(debug: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if debug { "debug" } else { "info" };
        EnvFilter::new(level)
    });

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
