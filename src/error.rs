//! Error types for mqpump using snafu.
//!
//! One enum per component with context selectors, aggregated into the
//! top-level [`PipelineError`] returned by the CLI commands.

use snafu::prelude::*;

// ============ Config Errors ============

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[snafu(display("Failed to read configuration file '{path}'"))]
    ReadConfig {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Could not determine the path of the running executable.
    #[snafu(display("Failed to locate the executable directory"))]
    ExecutablePath { source: std::io::Error },

    /// The selected source has no configuration block.
    #[snafu(display("Data source '{kind}' is not configured"))]
    SourceNotConfigured { kind: String },

    /// Database parallelism must be at least one worker.
    #[snafu(display("dataSources.database.parallel must be >= 1"))]
    InvalidParallel,

    /// Database batch size below the supported minimum.
    #[snafu(display("dataSources.database.batchSize must be >= 100"))]
    InvalidBatchSize,

    /// Database sharding needs at least one primary key column.
    #[snafu(display("dataSources.database.primaryKey must list at least one column"))]
    EmptyPrimaryKey,

    /// Publish rate must be positive.
    #[snafu(display("target.rps must be >= 1"))]
    InvalidRps,

    /// Plain-text mode cannot be combined with a conversion script.
    #[snafu(display("plain text mode is incompatible with script mode"))]
    PlainTextWithScript,

    /// Plain-text mode cannot be combined with record-structured sources.
    #[snafu(display("plain text mode is incompatible with the '{kind}' data source"))]
    PlainTextSource { kind: String },
}

// ============ Source Errors ============

/// Errors that can occur while opening or reading a data source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// Failed to open an input file.
    #[snafu(display("Failed to open file '{path}'"))]
    OpenFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to stat an input file.
    #[snafu(display("Failed to read metadata of '{path}'"))]
    FileMetadata {
        path: String,
        source: std::io::Error,
    },

    /// Failed to read an input file.
    #[snafu(display("Failed to read file '{path}'"))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to list a source directory.
    #[snafu(display("Failed to list directory '{path}'"))]
    ListDir {
        path: String,
        source: std::io::Error,
    },

    /// IO error while scanning an input stream.
    #[snafu(display("Read failed"))]
    Io { source: std::io::Error },

    /// A line exceeded the scanner buffer cap.
    #[snafu(display("Line exceeds the {limit} byte buffer limit"))]
    LineTooLong { limit: usize },

    /// CSV parse error.
    #[snafu(display("Failed to read csv record"))]
    CsvRead { source: csv::Error },

    /// JSON decode error for a record.
    #[snafu(display("Failed to decode record as JSON"))]
    JsonDecode { source: serde_json::Error },

    /// JSON decode error for a whole file.
    #[snafu(display("Failed to decode '{path}' as JSON"))]
    JsonDecodeFile {
        path: String,
        source: serde_json::Error,
    },

    /// Failed to build the database connection pool.
    #[snafu(display("Failed to create database connection pool"))]
    CreatePool {
        source: deadpool_postgres::CreatePoolError,
    },

    /// Failed to check a connection out of the pool.
    #[snafu(display("Failed to acquire database connection"))]
    AcquireConnection {
        source: deadpool_postgres::PoolError,
    },

    /// A database statement failed.
    #[snafu(display("Database query failed: {context}"))]
    Query {
        context: String,
        source: tokio_postgres::Error,
    },

    /// A column value could not be decoded.
    #[snafu(display("Failed to decode column '{column}'"))]
    DecodeColumn {
        column: String,
        source: tokio_postgres::Error,
    },

    /// A column has a type the row decoder cannot represent.
    #[snafu(display("Unsupported type '{type_name}' for column '{column}'"))]
    UnsupportedColumn { column: String, type_name: String },

    /// SQL statement could not be parsed.
    #[snafu(display("Failed to parse SQL query"))]
    SqlParse {
        source: sqlparser::parser::ParserError,
    },

    /// SQL statement has an unexpected shape.
    #[snafu(display("Unsupported SQL query: {message}"))]
    UnsupportedQuery { message: String },

    /// A background fetch worker panicked or was aborted.
    #[snafu(display("Fetch worker failed"))]
    WorkerJoin { source: tokio::task::JoinError },

    /// Failed to connect to the AMQP broker.
    #[snafu(display("Failed to connect to AMQP broker"))]
    AmqpConnect { source: lapin::Error },

    /// Failed to set up the AMQP consumer.
    #[snafu(display("Failed to start AMQP consumer"))]
    AmqpConsume { source: lapin::Error },

    /// Failed to acknowledge a delivery.
    #[snafu(display("Failed to ack delivery{}", format_request_id(request_id)))]
    AmqpAck {
        request_id: Option<String>,
        source: lapin::Error,
    },

    /// A consumed delivery carried a body that is not valid JSON.
    #[snafu(display("Failed to decode delivery body{}", format_request_id(request_id)))]
    DeliveryDecode {
        request_id: Option<String>,
        source: serde_json::Error,
    },

    /// The consumer stream reported an error.
    #[snafu(display("AMQP consumer failed"))]
    Consumer { source: lapin::Error },
}

fn format_request_id(request_id: &Option<String>) -> String {
    match request_id {
        Some(id) => format!("; request id = {id}"),
        None => String::new(),
    }
}

// ============ Script Errors ============

/// Errors that can occur while compiling or running the conversion script.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ScriptError {
    /// Failed to read the script file.
    #[snafu(display("Failed to read script '{path}'"))]
    ReadScript {
        path: String,
        source: std::io::Error,
    },

    /// Script failed to compile.
    #[snafu(display("Failed to compile script: {message}"))]
    Compile { message: String },

    /// Script execution exceeded the hard timeout.
    #[snafu(display("Script execution timed out"))]
    Timeout,

    /// Script execution raised an error.
    #[snafu(display("Script execution failed: {message}"))]
    Execute { message: String },

    /// A record could not cross the script boundary.
    #[snafu(display("Failed to pass record to the script: {message}"))]
    Bind { message: String },
}

// ============ Publish Errors ============

/// Errors that can occur while publishing to the target queue.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PublishError {
    /// Record could not be serialized to a message body.
    #[snafu(display("Failed to marshal payload"))]
    Encode { source: serde_json::Error },

    /// Failed to connect to the target broker.
    #[snafu(display("Failed to connect to target AMQP broker"))]
    Connect { source: lapin::Error },

    /// Publish still failing after the retry window.
    #[snafu(display("Failed to publish message to '{routing_key}'"))]
    Publish {
        routing_key: String,
        source: lapin::Error,
    },

    /// Publish was abandoned because the run is shutting down.
    #[snafu(display("Publish cancelled"))]
    PublishCancelled,
}

// ============ Pipeline Error (top-level) ============

/// Top-level errors that aggregate all component error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Data source error.
    #[snafu(display("Data source error"))]
    GetData { source: SourceError },

    /// Script conversion error.
    #[snafu(display("Failed to convert data with script"))]
    Convert { source: ScriptError },

    /// Publish error.
    #[snafu(display("Failed to publish data to target"))]
    Submit { source: PublishError },

    /// The run was cancelled by a shutdown signal.
    #[snafu(display("Cancelled"))]
    Cancelled,

    /// Failed to write the generated configuration file.
    #[snafu(display("Failed to write config file '{path}'"))]
    WriteConfig {
        path: String,
        source: std::io::Error,
    },
}
