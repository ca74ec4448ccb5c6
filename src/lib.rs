//! mqpump: a tool for transferring data from bulk sources to a single
//! RabbitMQ queue.
//!
//! Records are pulled from one of four sources (CSV file, line-delimited
//! JSON file or directory of JSON files, PostgreSQL table, RabbitMQ queue),
//! optionally converted by a user script, and published under a rate limit
//! with live progress reporting.

pub mod commands;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod publish;
pub mod script;
pub mod source;
pub mod types;

// Re-export main types
pub use config::Config;
pub use error::PipelineError;
pub use pipeline::PublishPipeline;
pub use types::{Payload, Record, SourceProgress};
