//! The capture loop: poll, buffer, and on a full window flush and hand the
//! artifact to the publisher.
//!
//! Every expected condition (failed fetch, empty poll, incomplete window,
//! empty flush) is an explicit [`TickOutcome`]; nothing in a tick is fatal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::buffer::{AggregationBuffer, Artifact, BufferStatus};
use crate::error::{FeedError, FlushError};
use crate::feed::FeedSource;
use crate::publish::Publisher;
use crate::record::PositionRecord;
use crate::retry::RetryPolicy;

/// Artifacts that may wait for the publisher before a tick blocks on handoff.
const PUBLISH_QUEUE: usize = 16;

#[derive(Debug)]
pub enum TickOutcome {
    /// Every poll attempt failed; the buffer was not touched.
    FetchFailed {
        attempts: u32,
        consecutive_failed_ticks: u32,
        error: FeedError,
    },
    /// The feed answered with zero records.
    EmptyPoll,
    /// The batch was buffered and the window is still accumulating.
    Buffered(BufferStatus),
    Flushed(Artifact),
    /// The window was complete but there was nothing to flush.
    FlushSkipped,
    /// Writing the artifact failed; the window is kept for the next tick.
    FlushFailed(FlushError),
}

/// Counters reported when [`Orchestrator::run`] returns.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub artifacts_flushed: u64,
    pub artifacts_uploaded: u64,
    pub uploads_failed: u64,
}

pub struct Orchestrator<F> {
    feed: F,
    buffer: Arc<AggregationBuffer>,
    fetch_retry: RetryPolicy,
    consecutive_failed_ticks: u32,
}

impl<F: FeedSource> Orchestrator<F> {
    pub fn new(feed: F, buffer: Arc<AggregationBuffer>, fetch_retry: RetryPolicy) -> Self {
        Self {
            feed,
            buffer,
            fetch_retry,
            consecutive_failed_ticks: 0,
        }
    }

    /// Runs one tick: poll, buffer, and flush if the window is complete.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&mut self) -> TickOutcome {
        let records = match self.poll_with_retry().await {
            Ok(records) => {
                self.consecutive_failed_ticks = 0;
                records
            }
            Err((attempts, error)) => {
                self.consecutive_failed_ticks += 1;
                error!(
                    stage = "fetch",
                    error = %error,
                    attempts,
                    consecutive_failed_ticks = self.consecutive_failed_ticks,
                    "Feed poll failed, skipping tick"
                );
                return TickOutcome::FetchFailed {
                    attempts,
                    consecutive_failed_ticks: self.consecutive_failed_ticks,
                    error,
                };
            }
        };

        if records.is_empty() {
            warn!(stage = "fetch", "Feed returned no vehicles, skipping buffering");
            return TickOutcome::EmptyPoll;
        }

        if !self.buffer.add_batch(records) {
            let status = self.buffer.status();
            info!(
                batch_count = status.batch_count,
                target = status.target_batch_count,
                "Window not complete yet"
            );
            return TickOutcome::Buffered(status);
        }

        match self.flush_buffer().await {
            Ok(artifact) => TickOutcome::Flushed(artifact),
            Err(FlushError::EmptyBuffer) => {
                error!(stage = "flush", "Window reported complete but buffer is empty");
                TickOutcome::FlushSkipped
            }
            Err(e) => {
                error!(stage = "flush", error = %e, "Flush failed, window kept for next tick");
                TickOutcome::FlushFailed(e)
            }
        }
    }

    /// Runs the blocking file writes of a flush on the blocking pool.
    async fn flush_buffer(&self) -> Result<Artifact, FlushError> {
        let buffer = Arc::clone(&self.buffer);
        match tokio::task::spawn_blocking(move || buffer.flush()).await {
            Ok(result) => result,
            Err(e) => Err(FlushError::Io(std::io::Error::other(e))),
        }
    }

    async fn poll_with_retry(&self) -> Result<Vec<PositionRecord>, (u32, FeedError)> {
        let max_attempts = self.fetch_retry.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.feed.poll().await {
                Ok(records) => return Ok(records),
                Err(e) if attempt >= max_attempts => return Err((attempt, e)),
                Err(e) => {
                    let delay = self.fetch_retry.delay_after(attempt);
                    warn!(
                        stage = "fetch",
                        error = %e,
                        attempt,
                        retries_left = max_attempts - attempt,
                        delay_secs = delay.as_secs_f64(),
                        "Feed poll failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Ticks every `interval` until `shutdown` resolves.
    ///
    /// Flushed artifacts go to a separate publisher task, so the next window
    /// accumulates while the previous one uploads. Shutdown is only observed
    /// between ticks; once it fires the publisher finishes its queue before
    /// this returns.
    pub async fn run<S>(mut self, publisher: Publisher, interval: Duration, shutdown: S) -> RunSummary
    where
        S: Future<Output = ()>,
    {
        let (tx, mut rx) = mpsc::channel::<Artifact>(PUBLISH_QUEUE);

        let worker = tokio::spawn(async move {
            let mut uploaded = 0u64;
            let mut failed = 0u64;
            while let Some(artifact) = rx.recv().await {
                if publisher.publish(&artifact).await.is_uploaded() {
                    uploaded += 1;
                } else {
                    failed += 1;
                }
            }
            (uploaded, failed)
        });

        let mut summary = RunSummary::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            interval_secs = interval.as_secs_f64(),
            window = self.buffer.target_batch_count(),
            "Capture loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping capture loop");
                    break;
                }
                _ = ticker.tick() => {
                    summary.ticks += 1;
                    match self.tick().await {
                        TickOutcome::Flushed(artifact) => {
                            summary.artifacts_flushed += 1;
                            let path = artifact.path.clone();
                            if tx.send(artifact).await.is_err() {
                                error!(
                                    path = %path.display(),
                                    "Publisher stopped, artifact left on disk"
                                );
                            }
                        }
                        TickOutcome::FetchFailed { .. } | TickOutcome::FlushFailed(_) => {
                            summary.failed_ticks += 1;
                        }
                        _ => {}
                    }
                }
            }
        }

        // A partial window is flushed so a restart does not lose it.
        match self.flush_buffer().await {
            Ok(artifact) => {
                info!(
                    batches = artifact.batch_count,
                    target = self.buffer.target_batch_count(),
                    "Flushed partial window on shutdown"
                );
                summary.artifacts_flushed += 1;
                let path = artifact.path.clone();
                if tx.send(artifact).await.is_err() {
                    error!(path = %path.display(), "Publisher stopped, artifact left on disk");
                }
            }
            Err(FlushError::EmptyBuffer) => {}
            Err(e) => error!(stage = "flush", error = %e, "Failed to flush partial window on shutdown"),
        }

        drop(tx);
        match worker.await {
            Ok((uploaded, failed)) => {
                summary.artifacts_uploaded = uploaded;
                summary.uploads_failed = failed;
            }
            Err(e) => error!(error = %e, "Publisher task ended abnormally"),
        }

        info!(?summary, "Capture loop stopped");
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFeed;

    #[tokio::test(flavor = "current_thread")]
    async fn test_flush_completes_on_single_threaded_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(AggregationBuffer::new(2, dir.path()).unwrap());
        let mut orchestrator = Orchestrator::new(MockFeed::new(3, 11), buffer.clone(), RetryPolicy::none());

        assert!(matches!(orchestrator.tick().await, TickOutcome::Buffered(_)));
        let artifact = match orchestrator.tick().await {
            TickOutcome::Flushed(artifact) => artifact,
            other => panic!("expected flush, got {other:?}"),
        };

        assert_eq!(artifact.row_count, 24);
        assert!(artifact.path.exists());
        assert_eq!(buffer.status().batch_count, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_flush_failure_keeps_window() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(AggregationBuffer::new(1, dir.path()).unwrap());
        std::fs::remove_dir_all(dir.path().join("silver")).unwrap();
        let mut orchestrator = Orchestrator::new(MockFeed::new(1, 3), buffer.clone(), RetryPolicy::none());

        assert!(matches!(
            orchestrator.tick().await,
            TickOutcome::FlushFailed(FlushError::Io(_))
        ));
        assert_eq!(buffer.status().batch_count, 1);
    }
}
