//! Directory-of-JSON-files source.
//!
//! Treats every regular file in the directory as one record. The file's
//! basename (minus a trailing `.json`) becomes the payload's request id.
//! Percent progress is the share of total file bytes consumed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;

use crate::config::JsonSourceConfig;
use crate::error::{
    FileMetadataSnafu, JsonDecodeFileSnafu, ListDirSnafu, ReadFileSnafu, SourceError,
};
use crate::source::DataSource;
use crate::source::counter::FileManager;
use crate::types::{Payload, ProgressWatch, Record};

pub struct MultiJsonSource {
    files: FileManager,
    read_bytes: Arc<AtomicU64>,
    watch: ProgressWatch,
    plain_text: bool,
}

impl MultiJsonSource {
    pub fn open(cfg: &JsonSourceConfig, plain_text: bool) -> Result<Self, SourceError> {
        let dir: &Path = &cfg.file_path;
        let entries = std::fs::read_dir(dir).context(ListDirSnafu {
            path: dir.display().to_string(),
        })?;

        let mut file_names: Vec<PathBuf> = Vec::new();
        let mut files_size = 0u64;
        for entry in entries {
            let entry = entry.context(ListDirSnafu {
                path: dir.display().to_string(),
            })?;
            let metadata = entry.metadata().context(FileMetadataSnafu {
                path: entry.path().display().to_string(),
            })?;
            if metadata.is_dir() {
                continue;
            }
            files_size += metadata.len();
            file_names.push(entry.path());
        }
        // read_dir order is platform dependent; sort for a stable listing
        file_names.sort();

        let read_bytes = Arc::new(AtomicU64::new(0));
        let watch = ProgressWatch::bytes(Arc::clone(&read_bytes), files_size as f64);

        Ok(Self {
            files: FileManager::new(file_names),
            read_bytes,
            watch,
            plain_text,
        })
    }

    fn request_id_from_path(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_string_lossy();
        Some(name.strip_suffix(".json").unwrap_or(&name).to_string())
    }
}

#[async_trait]
impl DataSource for MultiJsonSource {
    async fn next(&mut self) -> Result<Option<Payload>, SourceError> {
        let Some(path) = self.files.next() else {
            return Ok(None);
        };

        let bytes = std::fs::read(path).context(ReadFileSnafu {
            path: path.display().to_string(),
        })?;

        let byte_count = bytes.len() as u64;
        let data = if self.plain_text {
            Record::Raw(Bytes::from(bytes))
        } else {
            Record::Json(serde_json::from_slice(&bytes).context(JsonDecodeFileSnafu {
                path: path.display().to_string(),
            })?)
        };

        let request_id = Self::request_id_from_path(path);
        self.read_bytes.fetch_add(byte_count, Ordering::Relaxed);
        self.watch.record_read();

        Ok(Some(Payload { request_id, data }))
    }

    fn watch(&self) -> ProgressWatch {
        self.watch.clone()
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> JsonSourceConfig {
        JsonSourceConfig {
            file_path: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_request_ids_come_from_file_stems() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("req-1.json"), br#"{"v":1}"#).unwrap();
        std::fs::write(dir.path().join("req-2.json"), br#"{"v":2}"#).unwrap();

        let mut source = MultiJsonSource::open(&config(&dir), false).unwrap();

        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first.request_id.as_deref(), Some("req-1"));
        assert_eq!(first.data, Record::Json(json!({"v": 1})));

        let second = source.next().await.unwrap().unwrap();
        assert_eq!(second.request_id.as_deref(), Some("req-2"));
        assert_eq!(second.data, Record::Json(json!({"v": 2})));

        assert!(source.next().await.unwrap().is_none());
        let progress = source.watch().snapshot();
        assert_eq!(progress.read_count, 2);
        assert!((progress.read_percent.unwrap() - 100.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_empty_directory_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let mut source = MultiJsonSource::open(&config(&dir), false).unwrap();
        assert!(source.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subdirectories_are_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("only.json"), b"42").unwrap();

        let mut source = MultiJsonSource::open(&config(&dir), false).unwrap();
        assert!(source.next().await.unwrap().is_some());
        assert!(source.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plain_text_keeps_bytes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blob.bin"), b"not json").unwrap();

        let mut source = MultiJsonSource::open(&config(&dir), true).unwrap();
        let payload = source.next().await.unwrap().unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("blob.bin"));
        let Record::Raw(bytes) = payload.data else {
            panic!("expected raw bytes");
        };
        assert_eq!(bytes.as_ref(), b"not json");
    }
}
