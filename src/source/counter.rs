//! Byte-counting reader and shared file cursor.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Pass-through reader that atomically counts the bytes it returns.
///
/// The counter handle is shared so progress can be observed while the
/// wrapped reader is owned by a parser.
pub struct ReaderCounter<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> ReaderCounter<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle onto the byte counter.
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.count)
    }

    /// Bytes read so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl<R: Read> Read for ReaderCounter<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Ordered list of file paths with an atomically advancing cursor.
///
/// Safe for concurrent callers even though current consumers pull from a
/// single task.
pub struct FileManager {
    files: Vec<PathBuf>,
    next_idx: AtomicUsize,
}

impl FileManager {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            next_idx: AtomicUsize::new(0),
        }
    }

    /// The next path, or `None` once the list is exhausted.
    pub fn next(&self) -> Option<&PathBuf> {
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed);
        self.files.get(idx)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
