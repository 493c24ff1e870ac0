use crate::config::{LoggingConfig, LoggingLevelsConfig};
use std::io;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// The most verbose level enabled in config. `verbose` forces debug.
pub fn level_for(levels: &LoggingLevelsConfig, verbose: bool) -> &'static str {
    if verbose || levels.debug {
        "debug"
    } else if levels.info {
        "info"
    } else if levels.warning {
        "warn"
    } else if levels.error {
        "error"
    } else {
        "off"
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays clean for
/// results. `RUST_LOG` wins over config.
pub fn init_logging(config: &LoggingConfig) {
    let level = level_for(&config.levels, config.verbose);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let show_file = config.format.location.show_file;
    let show_line = config.format.location.show_line;

    // Use Layer::boxed() to unify the types of the branches
    let fmt_layer = match (config.format.json, config.format.show_time) {
        (true, _) => fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_file(show_file)
            .with_line_number(show_line)
            .boxed(),
        (false, true) => fmt::layer()
            .with_writer(io::stderr)
            .with_target(show_file)
            .with_file(show_file)
            .with_line_number(show_line)
            .with_thread_names(config.verbose)
            .boxed(),
        (false, false) => fmt::layer()
            .with_writer(io::stderr)
            .with_target(show_file)
            .with_file(show_file)
            .with_line_number(show_line)
            .with_thread_names(config.verbose)
            .without_time()
            .boxed(),
    };

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
