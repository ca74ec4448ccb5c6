//! CLI subcommands.

pub mod generate_config;
pub mod publish;

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

pub use publish::PublishArgs;

/// Initialize logging. `RUST_LOG` overrides the configured level.
pub fn init_logging(level: LogLevel) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
