//! Tracing subscriber setup for the binary.
//!
//! Events go to stderr so stdout carries nothing but answers.  The filter
//! comes from `RUST_LOG`; without it, `default_directive` applies.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset and no verbosity was requested.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Map a `-v` count to a filter directive.
pub fn directive_for(verbose: u8) -> &'static str {
    match verbose {
        0 => DEFAULT_DIRECTIVE,
        1 => "pilotwire=debug,info",
        _ => "trace",
    }
}

/// Install the global subscriber.  Calling it twice is harmless: the second
/// call is ignored.
pub fn init(default_directive: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
