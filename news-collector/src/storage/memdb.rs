use super::Storage;
use crate::types::{AggregatorError, Item, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    items: HashMap<String, Item>,
    last_id: i64,
}

impl State {
    fn insert(&mut self, item: &Item) {
        if self.items.contains_key(&item.link) {
            return;
        }
        self.last_id += 1;
        let stored = Item {
            id: self.last_id,
            ..item.clone()
        };
        self.items.insert(item.link.clone(), stored);
    }
}

/// In-process storage used by tests and the `memory` backend.
#[derive(Default)]
pub struct MemDb {
    state: RwLock<State>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Storage for MemDb {
    async fn item(&self, link: &str) -> Result<Item> {
        self.state
            .read()
            .await
            .items
            .get(link)
            .cloned()
            .ok_or_else(|| AggregatorError::NotFound { link: link.to_string() })
    }

    async fn items(&self, n: usize) -> Result<Vec<Item>> {
        let state = self.state.read().await;
        let mut items: Vec<Item> = state.items.values().cloned().collect();
        items.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then(b.id.cmp(&a.id)));
        items.truncate(n);
        Ok(items)
    }

    async fn add_item(&self, item: &Item) -> Result<()> {
        self.state.write().await.insert(item);
        Ok(())
    }

    async fn add_items(&self, items: &[Item]) -> Result<()> {
        let mut state = self.state.write().await;
        for item in items {
            state.insert(item);
        }
        Ok(())
    }

    async fn update_item(&self, item: &Item) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .items
            .get_mut(&item.link)
            .ok_or_else(|| AggregatorError::NotFound { link: item.link.clone() })?;
        stored.title = item.title.clone();
        stored.description = item.description.clone();
        stored.pub_date = item.pub_date;
        Ok(())
    }

    async fn delete_item(&self, item: &Item) -> Result<()> {
        self.state.write().await.items.remove(&item.link);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(link: &str, title: &str, pub_date: i64) -> Item {
        Item {
            id: 0,
            title: title.to_string(),
            pub_date,
            description: format!("about {title}"),
            link: link.to_string(),
        }
    }

    #[tokio::test]
    async fn second_add_with_same_link_keeps_first_title() {
        let db = MemDb::new();
        db.add_item(&item("https://x/1", "first", 10)).await.unwrap();
        db.add_item(&item("https://x/1", "second", 20)).await.unwrap();

        let stored = db.item("https://x/1").await.unwrap();
        assert_eq!(stored.title, "first");
        assert_eq!(stored.pub_date, 10);
        assert_eq!(db.len().await, 1);
    }

    #[tokio::test]
    async fn storage_assigns_identity() {
        let db = MemDb::new();
        db.add_items(&[item("a", "a", 1), item("b", "b", 2)]).await.unwrap();

        let a = db.item("a").await.unwrap();
        let b = db.item("b").await.unwrap();
        assert!(a.id > 0 && b.id > 0);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn items_are_newest_first_and_limited() {
        let db = MemDb::new();
        db.add_items(&[item("t2", "t2", 200), item("t1", "t1", 300), item("t3", "t3", 100)])
            .await
            .unwrap();

        let links: Vec<String> = db.items(3).await.unwrap().into_iter().map(|i| i.link).collect();
        assert_eq!(links, ["t1", "t2", "t3"]);
        assert_eq!(db.items(2).await.unwrap().len(), 2);
        assert!(db.items(0).await.unwrap().is_empty());
        assert_eq!(db.items(usize::MAX).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn bulk_add_is_idempotent_per_element() {
        let db = MemDb::new();
        db.add_items(&[item("a", "one", 1), item("a", "two", 2), item("b", "b", 3)])
            .await
            .unwrap();
        db.add_items(&[item("b", "changed", 9)]).await.unwrap();

        assert_eq!(db.len().await, 2);
        assert_eq!(db.item("a").await.unwrap().title, "one");
        assert_eq!(db.item("b").await.unwrap().title, "b");
    }

    #[tokio::test]
    async fn update_overwrites_and_delete_removes() {
        let db = MemDb::new();
        db.add_item(&item("a", "old", 1)).await.unwrap();
        let id = db.item("a").await.unwrap().id;

        db.update_item(&item("a", "new", 5)).await.unwrap();
        let updated = db.item("a").await.unwrap();
        assert_eq!((updated.id, updated.title.as_str(), updated.pub_date), (id, "new", 5));

        db.delete_item(&updated).await.unwrap();
        assert!(matches!(db.item("a").await, Err(AggregatorError::NotFound { .. })));
        assert!(matches!(
            db.update_item(&item("a", "x", 1)).await,
            Err(AggregatorError::NotFound { .. })
        ));
    }
}
