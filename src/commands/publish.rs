//! `publish` command: wire a data source to the publisher and run the
//! pipeline.
//!
//! Loads the config file, applies CLI overrides, rejects invalid mode
//! combinations, then owns the lifecycle: source and publisher are closed
//! in reverse order of construction, and the total published count and
//! elapsed time are logged even when the run ends in an error.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, CsvSourceConfig, JsonSourceConfig, duration};
use crate::error::{
    ConfigError, ConfigSnafu, ConvertSnafu, PipelineError, PlainTextSourceSnafu,
    PlainTextWithScriptSnafu, SubmitSnafu,
};
use crate::pipeline::progress::ProgressReporter;
use crate::pipeline::{PublishPipeline, signal};
use crate::publish::{Publish, RmqPublisher};
use crate::script::Converter;
use crate::source::{self, SourceKind};

/// Flags of the `publish` subcommand.
#[derive(Debug, clap::Args)]
pub struct PublishArgs {
    /// Data source type
    #[arg(short, long, value_enum)]
    pub source: SourceKind,

    /// Path to the data source file (csv and json sources)
    #[arg(short = 'f', long)]
    pub filepath: Option<PathBuf>,

    /// Custom csv separator
    #[arg(long)]
    pub sep: Option<char>,

    /// Path to a file with the data conversion script
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Progress logging interval (e.g. 30s)
    #[arg(long, value_parser = parse_duration_flag)]
    pub log_interval: Option<Duration>,

    /// Log messages published to the queue
    #[arg(short = 'l', long)]
    pub log_msg: bool,

    /// Publish synchronously instead of through the worker pool
    #[arg(long)]
    pub sync: bool,

    /// Send read bytes as-is without deserialization (incompatible with
    /// the csv and db sources; disables scripts)
    #[arg(long)]
    pub plain_text: bool,
}

fn parse_duration_flag(value: &str) -> Result<Duration, String> {
    duration::parse(value)
}

pub async fn run(args: PublishArgs) -> Result<(), PipelineError> {
    let mut config = Config::load().context(ConfigSnafu)?;
    apply_overrides(&mut config, &args);
    super::init_logging(config.log_level);
    validate_modes(&config, args.source).context(ConfigSnafu)?;
    config.validate().context(ConfigSnafu)?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            signal::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    info!("reading from '{}' source", args.source);
    let data_source = source::build(args.source, &config, shutdown.clone()).await?;
    let publisher = Arc::new(
        RmqPublisher::connect(&config.target, shutdown.clone())
            .await
            .context(SubmitSnafu)?,
    );

    let mut pipeline = PublishPipeline::new(
        data_source,
        Arc::clone(&publisher) as Arc<dyn Publish>,
        shutdown.clone(),
    );
    if let Some(path) = &config.script_path {
        pipeline = pipeline.with_converter(Converter::from_file(path).context(ConvertSnafu)?);
    }

    let published = pipeline.published_counter();
    let done = CancellationToken::new();
    let reporter = config.progress_log_interval.map(|interval| {
        ProgressReporter::spawn(
            interval,
            pipeline.watch(),
            Arc::clone(&published),
            shutdown.clone(),
            done.clone(),
        )
    });

    let started = Instant::now();
    let result = pipeline.run(config.target.should_publish_sync).await;

    done.cancel();
    if let Some(handle) = reporter {
        let _ = handle.await;
    }

    // release in reverse order of acquisition
    publisher.close().await;
    if let Err(err) = pipeline.close_source().await {
        error!("failed to close data source: {err}");
    }

    info!(
        published = published.load(Ordering::Relaxed),
        elapsed_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
        "run finished"
    );
    result
}

/// Fold the CLI flags into the loaded config. Flags win; absent flags
/// leave the file's values in place.
fn apply_overrides(config: &mut Config, args: &PublishArgs) {
    match args.source {
        SourceKind::Json => {
            if let Some(path) = &args.filepath {
                config.data_sources.json = Some(JsonSourceConfig {
                    file_path: path.clone(),
                });
            }
        }
        SourceKind::Csv => {
            if args.filepath.is_some() || args.sep.is_some() {
                let current = config.data_sources.csv.take();
                let file_path = args
                    .filepath
                    .clone()
                    .or(current.as_ref().map(|c| c.file_path.clone()))
                    .unwrap_or_default();
                let sep = args.sep.or(current.map(|c| c.sep)).unwrap_or(',');
                config.data_sources.csv = Some(CsvSourceConfig { file_path, sep });
            }
        }
        SourceKind::Db | SourceKind::Rmq => {}
    }

    if let Some(script) = &args.script {
        config.script_path = Some(script.clone());
    }
    if let Some(interval) = args.log_interval {
        config.progress_log_interval = Some(interval);
    }
    if args.log_msg {
        config.target.enable_message_logs = true;
    }
    if args.sync {
        config.target.should_publish_sync = true;
    }
    if args.plain_text {
        config.is_plain_text_mode = true;
    }
}

/// Reject mode combinations that cannot work together.
fn validate_modes(config: &Config, kind: SourceKind) -> Result<(), ConfigError> {
    if config.is_plain_text_mode {
        ensure!(config.script_path.is_none(), PlainTextWithScriptSnafu);
        ensure!(
            !matches!(kind, SourceKind::Csv | SourceKind::Db),
            PlainTextSourceSnafu {
                kind: kind.to_string(),
            }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        serde_yaml::from_str(
            r#"
target:
  client:
    host: localhost
    username: guest
    password: guest
  publisher:
    routingKey: out
  rps: 100
"#,
        )
        .unwrap()
    }

    fn args(kind: SourceKind) -> PublishArgs {
        PublishArgs {
            source: kind,
            filepath: None,
            sep: None,
            script: None,
            log_interval: None,
            log_msg: false,
            sync: false,
            plain_text: false,
        }
    }

    #[test]
    fn test_filepath_flag_replaces_json_source() {
        let mut config = minimal_config();
        let mut publish_args = args(SourceKind::Json);
        publish_args.filepath = Some(PathBuf::from("/data/records.json"));

        apply_overrides(&mut config, &publish_args);
        assert_eq!(
            config.data_sources.json.unwrap().file_path,
            PathBuf::from("/data/records.json")
        );
    }

    #[test]
    fn test_sep_flag_updates_existing_csv_block() {
        let mut config = minimal_config();
        config.data_sources.csv = Some(CsvSourceConfig {
            file_path: PathBuf::from("/data/rows.csv"),
            sep: ',',
        });
        let mut publish_args = args(SourceKind::Csv);
        publish_args.sep = Some(';');

        apply_overrides(&mut config, &publish_args);
        let csv = config.data_sources.csv.unwrap();
        assert_eq!(csv.file_path, PathBuf::from("/data/rows.csv"));
        assert_eq!(csv.sep, ';');
    }

    #[test]
    fn test_plain_text_rejects_script() {
        let mut config = minimal_config();
        config.is_plain_text_mode = true;
        config.script_path = Some(PathBuf::from("convert.rhai"));
        assert!(matches!(
            validate_modes(&config, SourceKind::Json),
            Err(ConfigError::PlainTextWithScript)
        ));
    }

    #[test]
    fn test_plain_text_rejects_structured_sources() {
        let mut config = minimal_config();
        config.is_plain_text_mode = true;
        assert!(matches!(
            validate_modes(&config, SourceKind::Csv),
            Err(ConfigError::PlainTextSource { .. })
        ));
        assert!(matches!(
            validate_modes(&config, SourceKind::Db),
            Err(ConfigError::PlainTextSource { .. })
        ));
        assert!(validate_modes(&config, SourceKind::Json).is_ok());
        assert!(validate_modes(&config, SourceKind::Rmq).is_ok());
    }

    #[test]
    fn test_boolean_flags_only_enable() {
        let mut config = minimal_config();
        config.target.should_publish_sync = true;
        let publish_args = args(SourceKind::Json);

        apply_overrides(&mut config, &publish_args);
        assert!(config.target.should_publish_sync);
    }
}
