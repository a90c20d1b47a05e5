//! Tracing subscriber setup.
//!
//! Filter directives come from `RUST_LOG`; without it everything at `info`
//! and above is printed. Output goes to stderr so `state` and `sweep`
//! results on stdout stay machine-readable.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
