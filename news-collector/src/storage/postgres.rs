use super::Storage;
use crate::types::{AggregatorError, Item, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

/// Relational backend over a `news` table with a unique `link` column.
pub struct Postgres {
    db: PgPool,
}

impl Postgres {
    pub async fn new(database_url: &str) -> Result<Self> {
        let db = PgPool::connect(database_url).await?;
        sqlx::query("SELECT 1").execute(&db).await?;
        Ok(Self { db })
    }

    pub fn from_pool(db: PgPool) -> Self {
        Self { db }
    }

    /// Applies the embedded migrations.
    pub async fn setup_schema(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        info!("News schema is up to date");
        Ok(())
    }
}

fn item_from_row(row: &PgRow) -> Result<Item> {
    Ok(Item {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        pub_date: row.try_get("pub_date")?,
        description: row.try_get("description")?,
        link: row.try_get("link")?,
    })
}

#[async_trait]
impl Storage for Postgres {
    async fn item(&self, link: &str) -> Result<Item> {
        let row = sqlx::query(
            r#"
            SELECT id, title, description, pub_date, link
            FROM news
            WHERE link = $1
            "#,
        )
        .bind(link)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => item_from_row(&row),
            None => Err(AggregatorError::NotFound { link: link.to_string() }),
        }
    }

    async fn items(&self, n: usize) -> Result<Vec<Item>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, description, pub_date, link
            FROM news
            ORDER BY pub_date DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(n).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn add_item(&self, item: &Item) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO news (title, description, pub_date, link)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (link) DO NOTHING
            "#,
        )
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.pub_date)
        .bind(&item.link)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn add_items(&self, items: &[Item]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let titles: Vec<&str> = items.iter().map(|i| i.title.as_str()).collect();
        let descriptions: Vec<&str> = items.iter().map(|i| i.description.as_str()).collect();
        let pub_dates: Vec<i64> = items.iter().map(|i| i.pub_date).collect();
        let links: Vec<&str> = items.iter().map(|i| i.link.as_str()).collect();

        // one statement, so the batch is applied atomically
        let result = sqlx::query(
            r#"
            INSERT INTO news (title, description, pub_date, link)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::bigint[], $4::text[])
            ON CONFLICT (link) DO NOTHING
            "#,
        )
        .bind(&titles)
        .bind(&descriptions)
        .bind(&pub_dates)
        .bind(&links)
        .execute(&self.db)
        .await?;

        debug!(
            received = items.len(),
            inserted = result.rows_affected(),
            "Stored batch"
        );
        Ok(())
    }

    async fn update_item(&self, item: &Item) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE news
            SET title = $1, description = $2, pub_date = $3
            WHERE link = $4
            "#,
        )
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.pub_date)
        .bind(&item.link)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AggregatorError::NotFound { link: item.link.clone() });
        }
        Ok(())
    }

    async fn delete_item(&self, item: &Item) -> Result<()> {
        sqlx::query("DELETE FROM news WHERE link = $1")
            .bind(&item.link)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.db.close().await;
        Ok(())
    }
}
