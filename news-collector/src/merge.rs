//! Fan-in of many bounded channels into one.

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Forwards every message from `sources` into one receiver.
///
/// One reader task per source forwards into the shared destination; a closer
/// task holds the last destination sender until every reader has seen its
/// source close, so the destination closes exactly when all sources have.
/// Order is kept per source only. The destination holds one message per
/// source, after which producers wait.
pub fn merge<T: Send + 'static>(sources: Vec<mpsc::Receiver<T>>) -> mpsc::Receiver<T> {
    let (dest, merged) = mpsc::channel(sources.len().max(1));

    let readers: Vec<_> = sources
        .into_iter()
        .map(|mut source| {
            let dest = dest.clone();
            tokio::spawn(async move {
                while let Some(value) = source.recv().await {
                    if dest.send(value).await.is_err() {
                        // nobody is listening anymore; dropping `source`
                        // unblocks the producer
                        break;
                    }
                }
            })
        })
        .collect();

    tokio::spawn(async move {
        let count = readers.len();
        for result in join_all(readers).await {
            if let Err(e) = result {
                error!("Fan-in reader failed: {}", e);
            }
        }
        debug!(sources = count, "All fan-in sources closed");
        drop(dest);
    });

    merged
}
