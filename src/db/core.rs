use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::str::FromStr;
use tokio::time::Duration;
use tracing::{info, instrument};

use crate::TARGET_DB;

#[derive(Clone, Debug)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Get access to the database pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// SQLite reports contention as SQLITE_BUSY (5) or SQLITE_LOCKED (6).
pub trait DbLockErrorExt {
    fn is_database_lock_error(&self) -> bool;
}

impl DbLockErrorExt for sqlx::Error {
    fn is_database_lock_error(&self) -> bool {
        match self {
            sqlx::Error::Database(err) => err
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .is_some_and(|c| matches!(c & 0xff, 5 | 6)),
            _ => false,
        }
    }
}

/// Row counts reported by the `stats` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub articles: i64,
    pub ingested: i64,
    pub failed: i64,
    pub topics: i64,
    pub redirects: i64,
    pub quarantined: i64,
    pub events: i64,
    pub merged_events: i64,
    pub statements: i64,
    pub capability_calls: i64,
    pub failed_calls: i64,
}

impl Database {
    #[instrument(target = "db", level = "info")]
    pub async fn new(database_path: &str) -> Result<Self, sqlx::Error> {
        info!(target: TARGET_DB, "Creating database pool for: {}", database_path);

        let connect_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
                .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        info!(target: TARGET_DB, "Database pool created");

        let db = Database { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// A private in-memory database. A single connection that never expires,
    /// so the data lives as long as the pool.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Database { pool };
        db.initialize_schema().await?;
        Ok(db)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn collect_stats(&self) -> Result<StoreStats, sqlx::Error> {
        let count = |query: &'static str| async move {
            sqlx::query_scalar::<_, i64>(query)
                .fetch_one(self.pool())
                .await
        };

        Ok(StoreStats {
            articles: count("SELECT COUNT(*) FROM articles").await?,
            ingested: count("SELECT COUNT(*) FROM ingestions WHERE state = 'ingested'").await?,
            failed: count("SELECT COUNT(*) FROM ingestions WHERE state = 'failed'").await?,
            topics: count("SELECT COUNT(*) FROM topics WHERE redirect_to IS NULL").await?,
            redirects: count("SELECT COUNT(*) FROM topics WHERE redirect_to IS NOT NULL").await?,
            quarantined: count("SELECT COUNT(*) FROM topic_quarantine").await?,
            events: count("SELECT COUNT(*) FROM events WHERE merged_into IS NULL").await?,
            merged_events: count("SELECT COUNT(*) FROM events WHERE merged_into IS NOT NULL")
                .await?,
            statements: count("SELECT COUNT(*) FROM statements WHERE merged_into IS NULL").await?,
            capability_calls: count("SELECT COUNT(*) FROM capability_calls").await?,
            failed_calls: count("SELECT COUNT(*) FROM capability_calls WHERE outcome != 'success'")
                .await?,
        })
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so that lexical order is
/// chronological order.
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Protocol(format!("invalid timestamp '{}': {}", value, e)))
}

pub(crate) fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(value: &str) -> Result<NaiveDate, sqlx::Error> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| sqlx::Error::Protocol(format!("invalid date '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 10, 10, 0, 0).unwrap();
        let (a, b) = (format_timestamp(&earlier), format_timestamp(&later));
        assert!(a < b);
        assert_eq!(parse_timestamp(&a).unwrap(), earlier);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_in_memory_stats_start_empty() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(db.collect_stats().await.unwrap(), StoreStats::default());
    }
}
