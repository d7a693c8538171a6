use rand::Rng;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument};

use super::core::{format_timestamp, parse_timestamp, Database, DbLockErrorExt};
use crate::model::Article;
use crate::TARGET_DB;

fn article_from_row(row: &SqliteRow) -> Result<Article, sqlx::Error> {
    let published_at: String = row.try_get("published_at")?;
    Ok(Article {
        id: row.try_get("id")?,
        published_at: parse_timestamp(&published_at)?,
        headline: row.try_get("headline")?,
        text: row.try_get("body")?,
        url: row.try_get("url")?,
    })
}

impl Database {
    /// Stores an article unless one with the same id exists. Articles are
    /// immutable, so an existing row is left untouched. Returns whether a row
    /// was inserted.
    #[instrument(target = "db", level = "info", skip(self, article), fields(article_id = %article.id))]
    pub async fn store_article(&self, article: &Article) -> Result<bool, sqlx::Error> {
        let published_at = format_timestamp(&article.published_at);
        let stored_at = format_timestamp(&chrono::Utc::now());

        let mut backoff = 100; // initial delay in milliseconds
        let max_retries = 5;

        for attempt in 1..=max_retries {
            match sqlx::query(
                r#"
                INSERT OR IGNORE INTO articles (id, url, headline, body, published_at, stored_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&article.id)
            .bind(&article.url)
            .bind(&article.headline)
            .bind(&article.text)
            .bind(&published_at)
            .bind(&stored_at)
            .execute(self.pool())
            .await
            {
                Ok(result) => {
                    let inserted = result.rows_affected() == 1;
                    debug!(target: TARGET_DB, "Stored article {} (new: {})", article.id, inserted);
                    return Ok(inserted);
                }
                Err(err) if err.is_database_lock_error() && attempt < max_retries => {
                    info!(
                        target: TARGET_DB,
                        "Database is locked, waiting {}ms before retrying attempt {}/{}: {}",
                        backoff, attempt, max_retries, article.id
                    );
                    let jitter = rand::rng().random_range(0..50);
                    sleep(Duration::from_millis(backoff + jitter)).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => {
                    error!(target: TARGET_DB, "Failed to store article {}: {}", article.id, err);
                    return Err(err);
                }
            }
        }

        Err(sqlx::Error::Protocol(
            "Maximum retries exceeded for storing article".into(),
        ))
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn get_article(&self, article_id: &str) -> Result<Option<Article>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, url, headline, body, published_at FROM articles WHERE id = ?1",
        )
        .bind(article_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(article_from_row).transpose()
    }

    /// Stored articles that have not been successfully ingested, oldest first.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn pending_articles(&self, limit: i64) -> Result<Vec<Article>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.url, a.headline, a.body, a.published_at
            FROM articles a
            LEFT JOIN ingestions i ON i.article_id = a.id
            WHERE i.state IS NULL OR i.state != 'ingested'
            ORDER BY a.published_at ASC, a.id ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(article_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_articles_are_immutable() {
        let db = Database::in_memory().await.unwrap();
        let published = Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap();
        let article = Article::new("a-1", published, "original", "https://example.com/a-1")
            .with_headline("Budget");

        assert!(db.store_article(&article).await.unwrap());

        let mut changed = article.clone();
        changed.text = "rewritten".into();
        assert!(!db.store_article(&changed).await.unwrap());

        let stored = db.get_article("a-1").await.unwrap().unwrap();
        assert_eq!(stored, article);
        assert!(db.get_article("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_articles_ordered_by_publication() {
        let db = Database::in_memory().await.unwrap();
        for (id, day) in [("late", 20), ("early", 2)] {
            let published = Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap();
            db.store_article(&Article::new(id, published, "text", "https://example.com"))
                .await
                .unwrap();
        }
        let pending = db.pending_articles(10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }
}
