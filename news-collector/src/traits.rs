use crate::types::{Batch, Result};
use async_trait::async_trait;

/// Something a poll worker can pull a batch of items from.
#[async_trait]
pub trait PullFeed: Send + Sync {
    /// Perform one bounded fetch of `url` and return its normalized items.
    async fn pull(&self, url: &str) -> Result<Batch>;
}
