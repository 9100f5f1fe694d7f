//! Tracing subscriber setup for the `shardflow` binary.
//!
//! `RUST_LOG` selects levels (default `shardflow=info`). Output goes to
//! stderr so stdout stays free for command results; `RUST_LOG_FORMAT=json`
//! switches to one JSON object per line.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "shardflow=info";

/// Installs the global subscriber. Later calls are no-ops.
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// Installs the global subscriber with a custom fallback filter.
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    if json_requested() {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

fn json_requested() -> bool {
    std::env::var("RUST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}
