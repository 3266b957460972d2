use crate::storage::{with_deadline, Storage};
use crate::types::{AggregatorError, Batch, Result, WriteStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Drains merged batches into storage and stops the pipeline when storage
/// keeps failing.
pub struct StreamWriter {
    storage: Arc<dyn Storage>,
    threshold: u64,
    write_timeout: Duration,
    log_every: u64,
    stats: watch::Sender<WriteStats>,
}

impl StreamWriter {
    /// `threshold` is the number of failed writes tolerated before aborting;
    /// zero is raised to one.
    pub fn new(storage: Arc<dyn Storage>, threshold: u64, write_timeout: Duration) -> Self {
        let (stats, _) = watch::channel(WriteStats::default());
        Self {
            storage,
            threshold: threshold.max(1),
            write_timeout,
            log_every: 100,
            stats,
        }
    }

    /// Log running totals every `n` batches instead of every 100.
    pub fn log_every(mut self, n: u64) -> Self {
        self.log_every = n.max(1);
        self
    }

    /// Live view of the running totals.
    pub fn subscribe(&self) -> watch::Receiver<WriteStats> {
        self.stats.subscribe()
    }

    /// Writes every batch until `batches` closes and returns the totals, or
    /// fails with [`AggregatorError::WriteThreshold`] once failed writes reach
    /// the threshold.
    pub async fn write_to_storage(&self, mut batches: mpsc::Receiver<Batch>) -> Result<WriteStats> {
        let mut stats = WriteStats::default();

        while let Some(batch) = batches.recv().await {
            if batch.is_empty() {
                stats.batches += 1;
                self.publish(stats);
                continue;
            }

            let written = with_deadline(self.write_timeout, self.storage.add_items(&batch)).await;
            match written {
                Ok(()) => {
                    stats.batches += 1;
                    stats.items += batch.len() as u64;
                }
                Err(e) => {
                    stats.failures += 1;
                    warn!(
                        failures = stats.failures,
                        threshold = self.threshold,
                        items = batch.len(),
                        error = %e,
                        "Failed to store batch"
                    );
                    self.publish(stats);

                    if stats.failures >= self.threshold {
                        info!(
                            batches = stats.batches,
                            items = stats.items,
                            failures = stats.failures,
                            "Stream writer aborted"
                        );
                        return Err(AggregatorError::WriteThreshold {
                            threshold: self.threshold,
                            source: Box::new(e),
                        });
                    }
                    continue;
                }
            }

            self.publish(stats);
            if stats.batches % self.log_every == 0 {
                debug!(
                    batches = stats.batches,
                    items = stats.items,
                    failures = stats.failures,
                    "Stream writer progress"
                );
            }
        }

        info!(
            batches = stats.batches,
            items = stats.items,
            failures = stats.failures,
            "Stream writer finished"
        );
        Ok(stats)
    }

    fn publish(&self, stats: WriteStats) {
        self.stats.send_replace(stats);
    }
}
