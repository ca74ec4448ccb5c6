//! Line-delimited JSON file source.
//!
//! Reads one line per record. In structured mode the line is decoded with
//! serde_json; in plain-text mode the raw line bytes are passed through.
//! Byte progress sums line lengths, so the exact newline flavour of the
//! file does not skew the percent figure.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;

use crate::config::JsonSourceConfig;
use crate::error::{
    FileMetadataSnafu, IoSnafu, JsonDecodeSnafu, LineTooLongSnafu, OpenFileSnafu, SourceError,
};
use crate::source::DataSource;
use crate::types::{Payload, ProgressWatch, Record};

/// Longest accepted line.
const MAX_LINE_BYTES: usize = 1 << 20;

pub struct JsonSource {
    reader: BufReader<File>,
    line: Vec<u8>,
    read_bytes: Arc<AtomicU64>,
    watch: ProgressWatch,
    plain_text: bool,
}

impl JsonSource {
    pub fn open(cfg: &JsonSourceConfig, plain_text: bool) -> Result<Self, SourceError> {
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

        let read_bytes = Arc::new(AtomicU64::new(0));
        let watch = ProgressWatch::bytes(Arc::clone(&read_bytes), file_size as f64);

        Ok(Self {
            reader: BufReader::new(file),
            line: Vec::with_capacity(4096),
            read_bytes,
            watch,
            plain_text,
        })
    }

    /// Bytes of line content consumed so far (newlines excluded).
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }
}

/// Read one `\n`-terminated line into `buf`, enforcing the buffer cap.
///
/// Returns `false` at end of input. The trailing newline (and `\r`) is
/// stripped from the buffer.
fn read_capped_line(
    reader: &mut BufReader<File>,
    buf: &mut Vec<u8>,
) -> Result<bool, SourceError> {
    buf.clear();
    let n = reader
        .by_ref()
        .take((MAX_LINE_BYTES + 1) as u64)
        .read_until(b'\n', buf)
        .context(IoSnafu)?;
    if n == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    ensure!(
        buf.len() <= MAX_LINE_BYTES,
        LineTooLongSnafu {
            limit: MAX_LINE_BYTES
        }
    );
    Ok(true)
}

#[async_trait]
impl DataSource for JsonSource {
    async fn next(&mut self) -> Result<Option<Payload>, SourceError> {
        if !read_capped_line(&mut self.reader, &mut self.line)? {
            return Ok(None);
        }

        let data = if self.plain_text {
            Record::Raw(Bytes::copy_from_slice(&self.line))
        } else {
            Record::Json(serde_json::from_slice(&self.line).context(JsonDecodeSnafu)?)
        };

        self.read_bytes
            .fetch_add(self.line.len() as u64, Ordering::Relaxed);
        self.watch.record_read();

        Ok(Some(Payload::new(data)))
    }

    fn watch(&self) -> ProgressWatch {
        self.watch.clone()
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
