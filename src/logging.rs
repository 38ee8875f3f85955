//! Tracing subscriber setup for the binary.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive, e.g. `build_bisect=debug`.
pub const LOG_ENV: &str = "BISECT_LOG";

/// Default level for a `-v` count.
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    }
}

/// Install the global subscriber, writing to stderr. Later calls are ignored.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity).as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_names(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .ok();
}
