use crate::shutdown::{Shutdown, ShutdownReason};
use crate::types::{AggregatorError, ErrorClass};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// What the supervisor saw before the error line closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub received: u64,
    pub failures: u64,
    pub benign: u64,
    pub tripped: bool,
}

/// Counts poll errors and stops the pipeline once too many pile up.
pub struct ErrorSupervisor {
    threshold: u64,
    shutdown: Shutdown,
}

impl ErrorSupervisor {
    pub fn new(threshold: u64, shutdown: Shutdown) -> Self {
        Self {
            threshold: threshold.max(1),
            shutdown,
        }
    }

    /// Drains `errors` until every worker has closed its error line. Tripping
    /// the threshold does not stop the drain.
    pub async fn run(&self, mut errors: mpsc::Receiver<AggregatorError>) -> SupervisorReport {
        let mut report = SupervisorReport::default();

        while let Some(e) = errors.recv().await {
            report.received += 1;

            match e.class() {
                ErrorClass::Shutdown => {
                    report.benign += 1;
                    continue;
                }
                ErrorClass::Address => warn!(error = %e, "Feed address error"),
                ErrorClass::Operation { temporary } => {
                    warn!(error = %e, temporary, "Feed operation error")
                }
                ErrorClass::Other => debug!(error = %e, "Feed error"),
            }

            report.failures += 1;
            if report.failures >= self.threshold && !report.tripped {
                report.tripped = true;
                error!(
                    failures = report.failures,
                    threshold = self.threshold,
                    "Too many feed errors"
                );
                self.shutdown.trigger(ShutdownReason::ErrorThreshold);
            }
        }

        debug!(
            received = report.received,
            failures = report.failures,
            benign = report.benign,
            "Error supervisor finished"
        );
        report
    }
}
