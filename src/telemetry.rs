use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Filter directive for a configured level: this crate at `level`,
/// dependencies at `warn`.
pub fn default_directive(level: &str) -> String {
    format!("tenant_metering={level},meter={level},warn")
}

/// Install the global `tracing` subscriber. Output goes to stderr so report
/// output on stdout stays clean. `RUST_LOG` takes precedence over the
/// configured level. Calling this twice leaves the first subscriber in place.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.level)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let result = if config.json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}
