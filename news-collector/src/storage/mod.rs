//! The persistence contract and its backends.

pub mod memdb;
pub mod postgres;
pub mod redis_store;

pub use memdb::MemDb;
pub use postgres::Postgres;
pub use redis_store::RedisStore;

use crate::types::{AggregatorError, Item, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Idempotent item storage keyed by `Item::link`.
///
/// Calls are cancelled by dropping their future; bound them with
/// [`with_deadline`].
#[async_trait]
pub trait Storage: Send + Sync {
    /// The item stored under `link`, or [`AggregatorError::NotFound`].
    async fn item(&self, link: &str) -> Result<Item>;

    /// Up to `n` items, newest publication time first.
    async fn items(&self, n: usize) -> Result<Vec<Item>>;

    /// Inserts `item` unless its link is already stored, in which case the
    /// stored record is left untouched.
    async fn add_item(&self, item: &Item) -> Result<()>;

    /// Bulk form of [`Storage::add_item`], applied as one operation where the
    /// backend allows it.
    async fn add_items(&self, items: &[Item]) -> Result<()>;

    /// Overwrites title, description and publication time of the stored
    /// item with the same link.
    async fn update_item(&self, item: &Item) -> Result<()>;

    async fn delete_item(&self, item: &Item) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Runs a storage call, failing with [`AggregatorError::StorageTimeout`] if it
/// takes longer than `deadline`.
pub async fn with_deadline<T>(deadline: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| AggregatorError::StorageTimeout(deadline))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    #[default]
    Postgres,
    Redis,
}

impl Backend {
    pub fn needs_connection_string(self) -> bool {
        !matches!(self, Backend::Memory)
    }
}

/// Opens the configured backend.
pub async fn open(backend: Backend, connection_string: Option<&str>) -> Result<Arc<dyn Storage>> {
    let require = |conn: Option<&str>| {
        conn.map(str::to_string)
            .ok_or_else(|| AggregatorError::Config(format!("{backend:?} storage needs a connection string")))
    };

    let storage: Arc<dyn Storage> = match backend {
        Backend::Memory => Arc::new(MemDb::new()),
        Backend::Postgres => {
            let db = Postgres::new(&require(connection_string)?).await?;
            db.setup_schema().await?;
            Arc::new(db)
        }
        Backend::Redis => Arc::new(RedisStore::new(&require(connection_string)?, "news").await?),
    };

    info!(?backend, "Storage ready");
    Ok(storage)
}
