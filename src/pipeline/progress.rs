//! Periodic throughput reporting.
//!
//! Fires every interval (plus one final tick at shutdown) and logs a single
//! structured line with the read and published deltas, the publish rate,
//! and the percent of input consumed when the source knows its size.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::duration;
use crate::types::ProgressWatch;

pub struct ProgressReporter {
    interval: Duration,
    watch: ProgressWatch,
    published: Arc<AtomicU64>,
}

impl ProgressReporter {
    /// Launch the reporter. It stops (after one last report) when either
    /// `done` or `shutdown` is cancelled.
    pub fn spawn(
        interval: Duration,
        watch: ProgressWatch,
        published: Arc<AtomicU64>,
        shutdown: CancellationToken,
        done: CancellationToken,
    ) -> JoinHandle<()> {
        let reporter = Self {
            interval,
            watch,
            published,
        };
        tokio::spawn(reporter.run(shutdown, done))
    }

    async fn run(self, shutdown: CancellationToken, done: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick is immediate; skip it so deltas cover a full interval
        ticker.tick().await;

        let interval_text = duration::format(&self.interval);
        let interval_secs = self.interval.as_secs_f64();
        let mut last_read = 0u64;
        let mut last_published = 0u64;

        loop {
            let is_final = tokio::select! {
                _ = ticker.tick() => false,
                _ = done.cancelled() => true,
                _ = shutdown.cancelled() => true,
            };

            let progress = self.watch.snapshot();
            let published = self.published.load(Ordering::Relaxed);
            let read_delta = progress.read_count.saturating_sub(last_read);
            let published_delta = published.saturating_sub(last_published);
            let mps = published_delta as f64 / interval_secs;

            match progress.read_percent {
                Some(percent) => info!(
                    interval = %interval_text,
                    read = read_delta,
                    published = published_delta,
                    mps,
                    done_reading = %format!("{percent:.2}%"),
                    "progress..."
                ),
                None => info!(
                    interval = %interval_text,
                    read = read_delta,
                    published = published_delta,
                    mps,
                    "progress..."
                ),
            }

            last_read = progress.read_count;
            last_published = published;

            if is_final {
                return;
            }
        }
    }
}
