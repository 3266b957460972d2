//! One long-running poll worker per feed, fanned in to two merged lines.

use crate::merge::merge;
use crate::traits::PullFeed;
use crate::types::{AggregatorError, Batch, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Totals a worker reports when it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerTotals {
    pub url: String,
    pub polls: u64,
    pub failures: u64,
    /// Outcomes discarded because shutdown fired while the line was full.
    pub dropped: u64,
}

/// Output of [`Collector::poll`].
pub struct Polling {
    pub items: mpsc::Receiver<Batch>,
    pub errors: mpsc::Receiver<AggregatorError>,
    pub workers: Vec<JoinHandle<WorkerTotals>>,
}

pub struct Collector {
    source: Arc<dyn PullFeed>,
}

impl Collector {
    pub fn new(source: Arc<dyn PullFeed>) -> Self {
        Self { source }
    }

    /// Starts one worker per link, polling every `interval` until `shutdown`
    /// fires. Batches and errors of all workers are merged into one line each.
    pub fn poll(
        &self,
        links: &[String],
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<Polling> {
        if links.is_empty() {
            return Err(AggregatorError::NoFeeds);
        }

        let mut item_lines = Vec::with_capacity(links.len());
        let mut error_lines = Vec::with_capacity(links.len());
        let mut workers = Vec::with_capacity(links.len());

        for (id, url) in links.iter().enumerate() {
            let (items_tx, items_rx) = mpsc::channel(1);
            let (errors_tx, errors_rx) = mpsc::channel(1);
            item_lines.push(items_rx);
            error_lines.push(errors_rx);

            let worker = PollWorker {
                id,
                url: url.clone(),
                interval,
                source: self.source.clone(),
                items: items_tx,
                errors: errors_tx,
                shutdown: shutdown.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        info!("Started {} poll workers, interval {:?}", links.len(), interval);

        Ok(Polling {
            items: merge(item_lines),
            errors: merge(error_lines),
            workers,
        })
    }
}

struct PollWorker {
    id: usize,
    url: String,
    interval: Duration,
    source: Arc<dyn PullFeed>,
    items: mpsc::Sender<Batch>,
    errors: mpsc::Sender<AggregatorError>,
    shutdown: CancellationToken,
}

impl PollWorker {
    /// Polls immediately, then once per interval, until cancelled. Both
    /// output lines close when this returns and the senders drop.
    async fn run(self) -> WorkerTotals {
        let mut totals = WorkerTotals {
            url: self.url.clone(),
            ..Default::default()
        };

        loop {
            totals.polls += 1;
            let outcome = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => None,
                result = self.source.pull(&self.url) => Some(result),
            };

            match outcome {
                Some(Ok(batch)) => {
                    debug!(unit = self.id, url = %self.url, items = batch.len(), "Poll succeeded");
                    tokio::select! {
                        biased;

                        sent = self.items.send(batch) => {
                            if sent.is_err() {
                                debug!(unit = self.id, "Item line closed, batch dropped");
                            }
                        }
                        _ = self.shutdown.cancelled() => {
                            totals.dropped += 1;
                            debug!(unit = self.id, "Shutdown while the item line was full, batch dropped");
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    totals.failures += 1;
                    warn!(unit = self.id, url = %self.url, error = %e, "Poll failed");
                    tokio::select! {
                        biased;

                        sent = self.errors.send(e) => {
                            if sent.is_err() {
                                debug!(unit = self.id, "Error line closed, error dropped");
                            }
                        }
                        _ = self.shutdown.cancelled() => {
                            totals.dropped += 1;
                            debug!(unit = self.id, "Shutdown while the error line was full, error dropped");
                            break;
                        }
                    }
                }
                None => {
                    // the fetch was abandoned, it is not a completed poll
                    totals.polls -= 1;
                    break;
                }
            }

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        let _ = self.errors.send(AggregatorError::Cancelled).await;
        info!(
            unit = self.id,
            url = %self.url,
            polls = totals.polls,
            errors = totals.failures,
            dropped = totals.dropped,
            "Poll worker stopped"
        );
        totals
    }
}
