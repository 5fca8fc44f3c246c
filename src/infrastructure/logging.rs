//! Logging configuration
//!
//! Initializes tracing for the application. `RUST_LOG` overrides the level
//! given on the command line.

/// Initializes logging with the specified level
///
/// Logs go to stderr so job output on stdout stays clean. Calling this more
/// than once keeps the first subscriber.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .try_init();
}
