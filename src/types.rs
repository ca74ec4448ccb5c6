//! Core data model shared across sources, the driver, and the publisher.
//!
//! A [`Payload`] is one record in transit: an optional request id plus a
//! [`Record`], which is either a column map, a decoded JSON value, or raw
//! bytes (plain-text mode). Progress is observed through a cloneable
//! [`ProgressWatch`] backed by atomics so the reporter can sample it while
//! the driver is pulling records.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::Value;

/// One record in transit through the pipeline.
#[derive(Debug, Clone)]
pub struct Payload {
    /// Correlation id, populated by the multi-JSON and AMQP sources.
    pub request_id: Option<String>,
    /// The record body.
    pub data: Record,
}

impl Payload {
    pub fn new(data: Record) -> Self {
        Self {
            request_id: None,
            data,
        }
    }

    pub fn with_request_id(data: Record, request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            data,
        }
    }
}

/// A record body.
///
/// Dynamic decisions are confined to [`Record::encode`]: everywhere else the
/// pipeline only moves the value along.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Column-name to value mapping (CSV and database rows), in column order.
    Map(IndexMap<String, Value>),
    /// Arbitrary decoded JSON value (JSON and AMQP sources).
    Json(Value),
    /// Opaque bytes, never parsed (plain-text mode).
    Raw(Bytes),
}

impl Record {
    /// Serialize this record to a message body.
    ///
    /// Raw bytes pass through verbatim; structured records are JSON-encoded.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            Record::Raw(bytes) => Ok(bytes.clone()),
            Record::Map(map) => Ok(serde_json::to_vec(map)?.into()),
            Record::Json(value) => Ok(serde_json::to_vec(value)?.into()),
        }
    }

    /// View this record as a JSON value for script conversion.
    ///
    /// Returns `None` for raw bytes; plain-text mode never reaches the
    /// converter because the combination is rejected at configuration time.
    pub fn into_json(self) -> Option<Value> {
        match self {
            Record::Map(map) => Some(Value::Object(map.into_iter().collect())),
            Record::Json(value) => Some(value),
            Record::Raw(_) => None,
        }
    }
}

/// A snapshot of source progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceProgress {
    /// Number of records handed out so far.
    pub read_count: u64,
    /// Percent of the input consumed, when the source has a finite size.
    pub read_percent: Option<f64>,
}

/// How a source derives its percent-complete figure.
#[derive(Debug, Clone)]
enum Denominator {
    /// Bytes consumed out of a known total (file sources).
    Bytes { counter: Arc<AtomicU64>, total: f64 },
    /// Records read out of a known total (database source).
    Rows { total: f64 },
    /// No finite size (AMQP source).
    Indeterminate,
}

/// Cloneable handle onto a source's progress counters.
///
/// Sources increment through their own handle; the progress reporter holds a
/// clone and calls [`ProgressWatch::snapshot`] concurrently.
#[derive(Debug, Clone)]
pub struct ProgressWatch {
    read: Arc<AtomicU64>,
    denominator: Denominator,
}

impl ProgressWatch {
    /// Progress measured as bytes consumed out of `total_bytes`.
    pub fn bytes(counter: Arc<AtomicU64>, total_bytes: f64) -> Self {
        Self {
            read: Arc::new(AtomicU64::new(0)),
            denominator: Denominator::Bytes {
                counter,
                total: total_bytes,
            },
        }
    }

    /// Progress measured as records read out of `total_rows`.
    pub fn rows(total_rows: f64) -> Self {
        Self {
            read: Arc::new(AtomicU64::new(0)),
            denominator: Denominator::Rows { total: total_rows },
        }
    }

    /// Progress with no percent figure.
    pub fn indeterminate() -> Self {
        Self {
            read: Arc::new(AtomicU64::new(0)),
            denominator: Denominator::Indeterminate,
        }
    }

    /// Count one record as read.
    pub fn record_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent snapshot of the counters.
    pub fn snapshot(&self) -> SourceProgress {
        let read_count = self.read.load(Ordering::Relaxed);
        let read_percent = match &self.denominator {
            Denominator::Bytes { counter, total } => {
                Some(counter.load(Ordering::Relaxed) as f64 / total * 100.0)
            }
            Denominator::Rows { total } => Some(read_count as f64 / total * 100.0),
            Denominator::Indeterminate => None,
        };
        SourceProgress {
            read_count,
            read_percent,
        }
    }
}
