//! Publish pipeline driver.
//!
//! Couples a data source to the publisher, with optional script
//! conversion. Sync mode publishes inline on the pull loop; async mode
//! fans submissions out to a bounded worker pool and aborts on the first
//! worker error. In both modes a cancelled shutdown token surfaces as
//! [`PipelineError::Cancelled`] after in-flight work has drained.

pub mod progress;
pub mod signal;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::prelude::*;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, info_span};

use crate::error::{
    CancelledSnafu, ConvertSnafu, GetDataSnafu, PipelineError, SourceError, SubmitSnafu,
};
use crate::publish::Publish;
use crate::script::Converter;
use crate::source::DataSource;
use crate::types::{Payload, ProgressWatch, Record};

/// Fixed size of the async publish worker pool.
const POOL_SIZE: usize = 300;

/// Converts and publishes one record; shared by both modes.
struct Submitter {
    publisher: Arc<dyn Publish>,
    converter: Option<Arc<Converter>>,
    published: Arc<AtomicU64>,
}

impl Submitter {
    async fn submit(&self, payload: Payload) -> Result<(), PipelineError> {
        let Payload { request_id, data } = payload;
        match request_id {
            Some(id) => {
                let span = info_span!("record", request_id = %id);
                self.submit_record(data).instrument(span).await
            }
            None => self.submit_record(data).await,
        }
    }

    async fn submit_record(&self, data: Record) -> Result<(), PipelineError> {
        let record = match (&self.converter, data) {
            (Some(converter), data) => match data.into_json() {
                Some(value) => match converter.convert(value).context(ConvertSnafu)? {
                    Some(converted) => Record::Json(converted),
                    // script dropped the record
                    None => return Ok(()),
                },
                None => return Ok(()),
            },
            (None, data) => data,
        };

        self.publisher.publish(&record).await.context(SubmitSnafu)?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// The pipeline driver.
pub struct PublishPipeline {
    source: Box<dyn DataSource>,
    publisher: Arc<dyn Publish>,
    converter: Option<Arc<Converter>>,
    published: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl PublishPipeline {
    pub fn new(
        source: Box<dyn DataSource>,
        publisher: Arc<dyn Publish>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            publisher,
            converter: None,
            published: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = Some(Arc::new(converter));
        self
    }

    /// Counter of successfully published records.
    pub fn published_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.published)
    }

    /// Progress handle of the underlying source.
    pub fn watch(&self) -> ProgressWatch {
        self.source.watch()
    }

    /// Run to completion, first error, or cancellation.
    pub async fn run(&mut self, sync: bool) -> Result<(), PipelineError> {
        if sync {
            self.run_sync().await
        } else {
            self.run_async().await
        }
    }

    /// Close the underlying source.
    pub async fn close_source(&mut self) -> Result<(), SourceError> {
        self.source.close().await
    }

    fn submitter(&self) -> Submitter {
        Submitter {
            publisher: Arc::clone(&self.publisher),
            converter: self.converter.clone(),
            published: Arc::clone(&self.published),
        }
    }

    async fn run_sync(&mut self) -> Result<(), PipelineError> {
        let submitter = self.submitter();
        loop {
            let payload = tokio::select! {
                _ = self.shutdown.cancelled() => return CancelledSnafu.fail(),
                next = self.source.next() => next.context(GetDataSnafu)?,
            };
            let Some(payload) = payload else {
                return Ok(());
            };
            submitter.submit(payload).await?;
        }
    }

    async fn run_async(&mut self) -> Result<(), PipelineError> {
        let submitter = Arc::new(self.submitter());
        let semaphore = Arc::new(Semaphore::new(POOL_SIZE));
        let (err_tx, mut err_rx) = mpsc::channel::<PipelineError>(POOL_SIZE);
        let tracker = TaskTracker::new();

        let loop_result: Result<(), PipelineError> = loop {
            let payload = tokio::select! {
                _ = self.shutdown.cancelled() => break CancelledSnafu.fail(),
                next = self.source.next() => match next.context(GetDataSnafu) {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                }
            };

            // back-pressure: block once all pool workers are busy
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break CancelledSnafu.fail(),
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("semaphore is never closed")
                }
            };

            let submitter = Arc::clone(&submitter);
            let err_tx = err_tx.clone();
            tracker.spawn(async move {
                let _permit = permit;
                if let Err(err) = submitter.submit(payload).await {
                    // capacity equals the pool size, try_send cannot lose the first error
                    let _ = err_tx.try_send(err);
                }
            });

            if let Ok(err) = err_rx.try_recv() {
                break Err(err);
            }
        };

        // drain in-flight submissions before surfacing the outcome
        tracker.close();
        tracker.wait().await;
        drop(err_tx);

        match loop_result {
            Err(err) => Err(err),
            Ok(()) if self.shutdown.is_cancelled() => CancelledSnafu.fail(),
            Ok(()) => match err_rx.try_recv() {
                Ok(err) => Err(err),
                Err(_) => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Source yielding a fixed list of payloads.
    struct VecSource {
        items: Vec<Payload>,
        watch: ProgressWatch,
    }

    impl VecSource {
        fn new(items: Vec<Payload>) -> Self {
            let watch = ProgressWatch::rows(items.len() as f64);
            let mut items = items;
            items.reverse();
            Self { items, watch }
        }
    }

    #[async_trait]
    impl DataSource for VecSource {
        async fn next(&mut self) -> Result<Option<Payload>, SourceError> {
            match self.items.pop() {
                Some(payload) => {
                    self.watch.record_read();
                    Ok(Some(payload))
                }
                None => Ok(None),
            }
        }

        fn watch(&self) -> ProgressWatch {
            self.watch.clone()
        }

        async fn close(&mut self) -> Result<(), SourceError> {
            Ok(())
        }
    }

    /// Publisher collecting bodies in memory.
    #[derive(Default)]
    struct MemoryPublisher {
        bodies: Mutex<Vec<Bytes>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl Publish for MemoryPublisher {
        async fn publish(&self, record: &Record) -> Result<(), PublishError> {
            let mut bodies = self.bodies.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if bodies.len() >= limit {
                    return Err(PublishError::PublishCancelled);
                }
            }
            bodies.push(record.encode().unwrap());
            Ok(())
        }
    }

    fn json_payloads(count: usize) -> Vec<Payload> {
        (0..count)
            .map(|i| Payload::new(Record::Json(json!({ "n": i }))))
            .collect()
    }

    #[tokio::test]
    async fn test_sync_mode_publishes_everything_in_order() {
        let publisher = Arc::new(MemoryPublisher::default());
        let mut pipeline = PublishPipeline::new(
            Box::new(VecSource::new(json_payloads(5))),
            publisher.clone(),
            CancellationToken::new(),
        );
        let published = pipeline.published_counter();

        pipeline.run(true).await.unwrap();

        let bodies = publisher.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 5);
        assert_eq!(bodies[0].as_ref(), br#"{"n":0}"#);
        assert_eq!(bodies[4].as_ref(), br#"{"n":4}"#);
        assert_eq!(published.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_async_mode_publishes_everything() {
        let publisher = Arc::new(MemoryPublisher::default());
        let mut pipeline = PublishPipeline::new(
            Box::new(VecSource::new(json_payloads(1000))),
            publisher.clone(),
            CancellationToken::new(),
        );
        let published = pipeline.published_counter();

        pipeline.run(false).await.unwrap();

        assert_eq!(publisher.bodies.lock().unwrap().len(), 1000);
        assert_eq!(published.load(Ordering::Relaxed), 1000);
    }

    #[tokio::test]
    async fn test_script_drop_skips_publish_but_counts_reads() {
        let publisher = Arc::new(MemoryPublisher::default());
        let source = VecSource::new(json_payloads(10));
        let watch = source.watch();
        let mut pipeline = PublishPipeline::new(
            Box::new(source),
            publisher.clone(),
            CancellationToken::new(),
        )
        .with_converter(Converter::from_source("()").unwrap());
        let published = pipeline.published_counter();

        pipeline.run(true).await.unwrap();

        assert_eq!(publisher.bodies.lock().unwrap().len(), 0);
        assert_eq!(published.load(Ordering::Relaxed), 0);
        assert_eq!(watch.snapshot().read_count, 10);
    }

    #[tokio::test]
    async fn test_converter_reshapes_records() {
        let publisher = Arc::new(MemoryPublisher::default());
        let mut pipeline = PublishPipeline::new(
            Box::new(VecSource::new(json_payloads(1))),
            publisher.clone(),
            CancellationToken::new(),
        )
        .with_converter(Converter::from_source("#{ doubled: arg.n * 2 }").unwrap());

        pipeline.run(true).await.unwrap();

        let bodies = publisher.bodies.lock().unwrap();
        assert_eq!(bodies[0].as_ref(), br#"{"doubled":0}"#);
    }

    #[tokio::test]
    async fn test_publish_error_aborts_the_run() {
        let publisher = Arc::new(MemoryPublisher {
            bodies: Mutex::new(Vec::new()),
            fail_after: Some(3),
        });
        let mut pipeline = PublishPipeline::new(
            Box::new(VecSource::new(json_payloads(100))),
            publisher.clone(),
            CancellationToken::new(),
        );

        let result = pipeline.run(false).await;
        assert!(matches!(result, Err(PipelineError::Submit { .. })));
        assert_eq!(publisher.bodies.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sync_publish_error_stops_at_first_failure() {
        let publisher = Arc::new(MemoryPublisher {
            bodies: Mutex::new(Vec::new()),
            fail_after: Some(2),
        });
        let mut pipeline = PublishPipeline::new(
            Box::new(VecSource::new(json_payloads(100))),
            publisher.clone(),
            CancellationToken::new(),
        );

        let result = pipeline.run(true).await;
        assert!(matches!(result, Err(PipelineError::Submit { .. })));
        assert_eq!(publisher.bodies.lock().unwrap().len(), 2);
    }

    // the driver's pull loop is hot here, so give the canceller its own worker
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancellation_returns_cancelled() {
        /// Source that never ends until cancelled.
        struct EndlessSource {
            watch: ProgressWatch,
        }

        #[async_trait]
        impl DataSource for EndlessSource {
            async fn next(&mut self) -> Result<Option<Payload>, SourceError> {
                self.watch.record_read();
                Ok(Some(Payload::new(Record::Json(json!(1)))))
            }

            fn watch(&self) -> ProgressWatch {
                self.watch.clone()
            }

            async fn close(&mut self) -> Result<(), SourceError> {
                Ok(())
            }
        }

        let shutdown = CancellationToken::new();
        let publisher = Arc::new(MemoryPublisher::default());
        let mut pipeline = PublishPipeline::new(
            Box::new(EndlessSource {
                watch: ProgressWatch::indeterminate(),
            }),
            publisher.clone(),
            shutdown.clone(),
        );
        let published = pipeline.published_counter();

        let canceller = tokio::spawn({
            let shutdown = shutdown.clone();
            let published = published.clone();
            async move {
                while published.load(Ordering::Relaxed) < 100 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                shutdown.cancel();
            }
        });

        let result = tokio::time::timeout(Duration::from_secs(5), pipeline.run(false))
            .await
            .expect("driver must drain within the deadline");
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert!(published.load(Ordering::Relaxed) >= 100);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_published_never_exceeds_read() {
        let publisher = Arc::new(MemoryPublisher::default());
        let source = VecSource::new(json_payloads(500));
        let watch = source.watch();
        let mut pipeline =
            PublishPipeline::new(Box::new(source), publisher, CancellationToken::new());
        let published = pipeline.published_counter();

        pipeline.run(false).await.unwrap();

        let progress = watch.snapshot();
        assert_eq!(progress.read_count, 500);
        assert_eq!(published.load(Ordering::Relaxed), 500);
        assert!(published.load(Ordering::Relaxed) <= progress.read_count);
    }
}
