//! CSV file source.
//!
//! Streams rows from a single CSV file. The first row is consumed as the
//! header; every following row becomes a column-name to string mapping.
//! Percent progress is derived from the bytes the parser has consumed out
//! of the file size.

use std::fs::File;
use std::path::Path;

use async_trait::async_trait;
use csv::StringRecord;
use indexmap::IndexMap;
use serde_json::Value;
use snafu::prelude::*;

use crate::config::CsvSourceConfig;
use crate::error::{CsvReadSnafu, FileMetadataSnafu, OpenFileSnafu, SourceError};
use crate::source::DataSource;
use crate::source::counter::ReaderCounter;
use crate::types::{Payload, ProgressWatch, Record};

pub struct CsvSource {
    reader: csv::Reader<ReaderCounter<File>>,
    /// Reused row buffer.
    row: StringRecord,
    columns: Vec<String>,
    watch: ProgressWatch,
}

impl CsvSource {
    pub fn open(cfg: &CsvSourceConfig) -> Result<Self, SourceError> {
        let path: &Path = &cfg.file_path;
        let file = File::open(path).context(OpenFileSnafu {
            path: path.display().to_string(),
        })?;
        let file_size = file
            .metadata()
            .context(FileMetadataSnafu {
                path: path.display().to_string(),
            })?
            .len();

        let counting = ReaderCounter::new(file);
        let counter = counting.counter();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(cfg.sep as u8)
            .has_headers(false)
            .flexible(true)
            .from_reader(counting);

        let mut header = StringRecord::new();
        let got_header = reader.read_record(&mut header).context(CsvReadSnafu)?;
        if !got_header {
            let empty = std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "csv file has no header row",
            );
            return Err(SourceError::CsvRead {
                source: csv::Error::from(empty),
            });
        }
        let columns: Vec<String> = header.iter().map(str::to_string).collect();

        Ok(Self {
            reader,
            row: StringRecord::new(),
            columns,
            watch: ProgressWatch::bytes(counter, file_size as f64),
        })
    }
}

#[async_trait]
impl DataSource for CsvSource {
    async fn next(&mut self) -> Result<Option<Payload>, SourceError> {
        if !self.reader.read_record(&mut self.row).context(CsvReadSnafu)? {
            return Ok(None);
        }

        let mut data = IndexMap::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let cell = self.row.get(i).unwrap_or_default();
            data.insert(column.clone(), Value::String(cell.to_string()));
        }

        self.watch.record_read();
        Ok(Some(Payload::new(Record::Map(data))))
    }

    fn watch(&self) -> ProgressWatch {
        self.watch.clone()
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
