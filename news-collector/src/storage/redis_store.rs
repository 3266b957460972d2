//! Document-store backend: every item is a JSON document in Redis.
//!
//! Layout under a key prefix `p`:
//! - `p:item:<link>` the item document
//! - `p:by_pub_date` sorted set of links scored by publication time
//! - `p:seq` identity sequence
//!
//! Writes run as Lua scripts so each call is applied atomically. The scripts
//! address document keys computed from the prefix, so the store does not
//! support Redis Cluster.

use super::Storage;
use crate::types::{AggregatorError, Item, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::debug;

const UPSERT_SCRIPT: &str = r#"
local inserted = 0
for i = 2, #ARGV do
    local doc = cjson.decode(ARGV[i])
    local key = ARGV[1] .. doc.link
    if redis.call('EXISTS', key) == 0 then
        doc.id = redis.call('INCR', KEYS[2])
        redis.call('SET', key, cjson.encode(doc))
        redis.call('ZADD', KEYS[1], doc.pubDate, doc.link)
        inserted = inserted + 1
    end
end
return inserted
"#;

const UPDATE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local doc = cjson.decode(current)
local changes = cjson.decode(ARGV[1])
doc.title = changes.title
doc.description = changes.description
doc.pubDate = changes.pubDate
redis.call('SET', KEYS[1], cjson.encode(doc))
redis.call('ZADD', KEYS[2], doc.pubDate, doc.link)
return 1
"#;

pub struct RedisStore {
    conn: MultiplexedConnection,
    item_prefix: String,
    index_key: String,
    seq_key: String,
    upsert: Script,
    update: Script,
}

impl RedisStore {
    pub async fn new(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            conn,
            item_prefix: format!("{prefix}:item:"),
            index_key: format!("{prefix}:by_pub_date"),
            seq_key: format!("{prefix}:seq"),
            upsert: Script::new(UPSERT_SCRIPT),
            update: Script::new(UPDATE_SCRIPT),
        })
    }

    fn item_key(&self, link: &str) -> String {
        format!("{}{}", self.item_prefix, link)
    }
}

#[async_trait]
impl Storage for RedisStore {
    async fn item(&self, link: &str) -> Result<Item> {
        let mut conn = self.conn.clone();
        let doc: Option<String> = conn.get(self.item_key(link)).await?;
        match doc {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Err(AggregatorError::NotFound { link: link.to_string() }),
        }
    }

    async fn items(&self, n: usize) -> Result<Vec<Item>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let stop = isize::try_from(n).unwrap_or(isize::MAX) - 1;
        let links: Vec<String> = conn.zrevrange(&self.index_key, 0, stop).await?;
        if links.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = links.iter().map(|link| self.item_key(link)).collect();
        let docs: Vec<Option<String>> = conn.mget(keys).await?;

        // a document deleted between the two calls is skipped
        docs.into_iter()
            .flatten()
            .map(|doc| serde_json::from_str(&doc).map_err(AggregatorError::from))
            .collect()
    }

    async fn add_item(&self, item: &Item) -> Result<()> {
        self.add_items(std::slice::from_ref(item)).await
    }

    async fn add_items(&self, items: &[Item]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut invocation = self.upsert.prepare_invoke();
        invocation.key(&self.index_key).key(&self.seq_key).arg(&self.item_prefix);
        for item in items {
            invocation.arg(serde_json::to_string(item)?);
        }

        let mut conn = self.conn.clone();
        let inserted: i64 = invocation.invoke_async(&mut conn).await?;
        debug!(received = items.len(), inserted, "Stored batch");
        Ok(())
    }

    async fn update_item(&self, item: &Item) -> Result<()> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .update
            .key(self.item_key(&item.link))
            .key(&self.index_key)
            .arg(serde_json::to_string(item)?)
            .invoke_async(&mut conn)
            .await?;

        if updated == 0 {
            return Err(AggregatorError::NotFound { link: item.link.clone() });
        }
        Ok(())
    }

    async fn delete_item(&self, item: &Item) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(self.item_key(&item.link))
            .ignore()
            .zrem(&self.index_key, &item.link)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // the multiplexed connection closes when the last clone drops
        Ok(())
    }
}
