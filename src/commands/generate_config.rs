//! `generate-config` command: write the embedded default configuration
//! to `config.yml` next to the executable.

use snafu::prelude::*;
use tracing::info;

use crate::config;
use crate::error::{ConfigSnafu, PipelineError, WriteConfigSnafu};

/// Default configuration embedded at build time.
pub const DEFAULT_CONFIG: &str = include_str!("../../conf/default_config.yml");

pub fn run() -> Result<(), PipelineError> {
    let path = config::default_config_path().context(ConfigSnafu)?;
    std::fs::write(&path, DEFAULT_CONFIG).context(WriteConfigSnafu {
        path: path.display().to_string(),
    })?;
    info!("config written to '{}'", path.display());
    Ok(())
}
