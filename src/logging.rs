//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const DEFAULT_LEVEL: &str = "info";

fn filter_or(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Plain stderr subscriber for the window before the configured one is
/// installed, so config loading is not silent.
pub fn bootstrap() -> impl tracing::Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt()
        .with_env_filter(filter_or(DEFAULT_LEVEL))
        .with_writer(std::io::stderr)
        .finish()
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
/// Safe to call more than once; later calls are ignored.
pub fn init(cfg: &LoggingConfig) {
    let filter = filter_or(&cfg.level);

    let result = if cfg.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
