//! Data sources.
//!
//! Every source implements the same pull contract: `next` yields payloads
//! until `None` marks end of stream, progress is observable concurrently
//! through a [`ProgressWatch`], and `close` is idempotent.

pub mod counter;
pub mod csv;
pub mod database;
pub mod json;
pub mod multi_json;
pub mod query;
pub mod rabbitmq;

use async_trait::async_trait;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{
    ConfigSnafu, GetDataSnafu, PipelineError, SourceError, SourceNotConfiguredSnafu,
};
use crate::types::{Payload, ProgressWatch};

pub use counter::{FileManager, ReaderCounter};

/// A bulk source of records.
#[async_trait]
pub trait DataSource: Send {
    /// Pull the next record; `None` means end of stream.
    async fn next(&mut self) -> Result<Option<Payload>, SourceError>;

    /// Handle for sampling progress concurrently with `next`.
    fn watch(&self) -> ProgressWatch;

    /// Release resources. Safe to call more than once.
    async fn close(&mut self) -> Result<(), SourceError>;
}

/// The selectable source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceKind {
    Csv,
    Json,
    Db,
    Rmq,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceKind::Csv => "csv",
            SourceKind::Json => "json",
            SourceKind::Db => "db",
            SourceKind::Rmq => "rmq",
        };
        f.write_str(name)
    }
}

/// Construct the configured source of the given kind.
///
/// For `json`, a directory path selects the multi-file source.
pub async fn build(
    kind: SourceKind,
    config: &Config,
    shutdown: CancellationToken,
) -> Result<Box<dyn DataSource>, PipelineError> {
    let source: Box<dyn DataSource> = match kind {
        SourceKind::Csv => {
            let cfg = require_config(config.data_sources.csv.as_ref(), "csv")?;
            Box::new(csv::CsvSource::open(cfg).context(GetDataSnafu)?)
        }
        SourceKind::Json => {
            let cfg = require_config(config.data_sources.json.as_ref(), "json")?;
            if cfg.file_path.is_dir() {
                Box::new(
                    multi_json::MultiJsonSource::open(cfg, config.is_plain_text_mode)
                        .context(GetDataSnafu)?,
                )
            } else {
                Box::new(
                    json::JsonSource::open(cfg, config.is_plain_text_mode)
                        .context(GetDataSnafu)?,
                )
            }
        }
        SourceKind::Db => {
            let cfg = require_config(config.data_sources.database.as_ref(), "db")?;
            Box::new(
                database::DatabaseSource::open(cfg, shutdown)
                    .await
                    .context(GetDataSnafu)?,
            )
        }
        SourceKind::Rmq => {
            let cfg = require_config(config.data_sources.rabbit_mq.as_ref(), "rmq")?;
            Box::new(
                rabbitmq::RabbitMqSource::open(cfg, config.is_plain_text_mode)
                    .await
                    .context(GetDataSnafu)?,
            )
        }
    };
    Ok(source)
}

fn require_config<'a, T>(block: Option<&'a T>, kind: &str) -> Result<&'a T, PipelineError> {
    block
        .context(SourceNotConfiguredSnafu { kind })
        .context(ConfigSnafu)
}
