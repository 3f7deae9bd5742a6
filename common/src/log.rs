//! Tracing setup shared by the command-line front-ends.

/// Initializes the global subscriber. `-v` occurrences map to levels:
/// 0 = ERROR, 1 = INFO, 2 = DEBUG, 3+ = TRACE; `RUST_LOG` wins when set.
pub fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
