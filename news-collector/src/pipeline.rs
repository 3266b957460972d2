//! Wires poll workers, the stream writer and the error supervisor together
//! under one shutdown signal.

use crate::collector::{Collector, Polling, WorkerTotals};
use crate::config::Config;
use crate::shutdown::{Shutdown, ShutdownReason};
use crate::storage::Storage;
use crate::stream_writer::StreamWriter;
use crate::supervisor::{ErrorSupervisor, SupervisorReport};
use crate::traits::PullFeed;
use crate::types::{AggregatorError, Result, WriteStats};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub interval: Duration,
    pub error_threshold: u64,
    pub write_failure_threshold: u64,
    pub write_timeout: Duration,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.poll_interval(),
            error_threshold: config.error_threshold,
            write_failure_threshold: config.write_failure_threshold(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// How a pipeline run ended.
#[derive(Debug)]
pub struct PipelineReport {
    pub reason: Option<ShutdownReason>,
    pub stats: WriteStats,
    pub errors: SupervisorReport,
    pub workers: Vec<WorkerTotals>,
    /// Set when the stream writer gave up.
    pub write_error: Option<AggregatorError>,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.write_error.is_none()
    }
}

pub struct Pipeline {
    source: Arc<dyn PullFeed>,
    storage: Arc<dyn Storage>,
    settings: PipelineSettings,
    shutdown: Shutdown,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn PullFeed>,
        storage: Arc<dyn Storage>,
        settings: PipelineSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            storage,
            settings,
            shutdown,
        }
    }

    /// Polls `links` until the shutdown signal fires, then waits for every
    /// task to finish.
    pub async fn run(&self, links: &[String]) -> Result<PipelineReport> {
        let collector = Collector::new(self.source.clone());
        let Polling {
            items,
            errors,
            workers,
        } = collector.poll(links, self.settings.interval, self.shutdown.token())?;

        let writer = StreamWriter::new(
            self.storage.clone(),
            self.settings.write_failure_threshold,
            self.settings.write_timeout,
        );
        let stats = writer.subscribe();
        let writer_shutdown = self.shutdown.clone();
        let writer_task = tokio::spawn(async move {
            let result = writer.write_to_storage(items).await;
            if let Err(e) = &result {
                error!(error = %e, "Stream writer failed");
                writer_shutdown.trigger(ShutdownReason::WriteFailure);
            }
            result
        });

        let supervisor = ErrorSupervisor::new(self.settings.error_threshold, self.shutdown.clone());
        let supervisor_task = tokio::spawn(async move { supervisor.run(errors).await });

        info!(feeds = links.len(), "Pipeline running");

        let mut totals = Vec::with_capacity(workers.len());
        for worker in workers {
            match worker.await {
                Ok(worker_totals) => totals.push(worker_totals),
                Err(e) => warn!(error = %e, "Poll worker task failed"),
            }
        }

        let write_error = match writer_task.await {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e),
            Err(e) => {
                warn!(error = %e, "Stream writer task failed");
                None
            }
        };
        let errors = supervisor_task.await.unwrap_or_else(|e| {
            warn!(error = %e, "Error supervisor task failed");
            SupervisorReport::default()
        });

        let report = PipelineReport {
            reason: self.shutdown.reason(),
            stats: *stats.borrow(),
            errors,
            workers: totals,
            write_error,
        };
        info!(
            reason = ?report.reason,
            batches = report.stats.batches,
            items = report.stats.items,
            write_failures = report.stats.failures,
            feed_errors = report.errors.failures,
            "Pipeline stopped"
        );
        Ok(report)
    }
}
