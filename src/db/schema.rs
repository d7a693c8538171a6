use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                headline TEXT,
                body TEXT NOT NULL,
                published_at TEXT NOT NULL,
                stored_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_articles_published_at ON articles (published_at);

            CREATE TABLE IF NOT EXISTS topics (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                redirect_to TEXT,
                FOREIGN KEY (redirect_to) REFERENCES topics (id)
            );
            CREATE INDEX IF NOT EXISTS idx_topics_redirect_to ON topics (redirect_to);

            -- Alias rows are never deleted; merged topics keep theirs and the
            -- survivor receives copies.
            CREATE TABLE IF NOT EXISTS topic_aliases (
                topic_id TEXT NOT NULL,
                alias TEXT NOT NULL,
                normalized_alias TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (topic_id, normalized_alias),
                FOREIGN KEY (topic_id) REFERENCES topics (id)
            );
            CREATE INDEX IF NOT EXISTS idx_topic_aliases_normalized ON topic_aliases (normalized_alias);

            CREATE TABLE IF NOT EXISTS topic_quarantine (
                topic_id TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                quarantined_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                topic_id TEXT NOT NULL,
                description TEXT NOT NULL,
                event_start TEXT,
                event_end TEXT,
                event_precision TEXT,
                report_time TEXT NOT NULL,
                confidence REAL NOT NULL,
                event_type TEXT,
                -- JSON array of names
                participants TEXT NOT NULL DEFAULT '[]',
                location TEXT,
                created_at TEXT NOT NULL,
                merged_into TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_topic ON events (topic_id, merged_into);

            CREATE TABLE IF NOT EXISTS event_provenance (
                event_id TEXT NOT NULL,
                article_id TEXT NOT NULL,
                report_time TEXT NOT NULL,
                added_at TEXT NOT NULL,
                PRIMARY KEY (event_id, article_id),
                FOREIGN KEY (event_id) REFERENCES events (id)
            );
            CREATE INDEX IF NOT EXISTS idx_event_provenance_article ON event_provenance (article_id);

            CREATE TABLE IF NOT EXISTS statements (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                topic_id TEXT NOT NULL,
                speaker_name TEXT NOT NULL,
                speaker_topic_id TEXT,
                speaker_key TEXT NOT NULL,
                speaker_role TEXT,
                quote TEXT NOT NULL,
                quote_key TEXT NOT NULL,
                stance TEXT NOT NULL,
                article_id TEXT NOT NULL,
                report_time TEXT NOT NULL,
                created_at TEXT NOT NULL,
                merged_into TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_statements_topic ON statements (topic_id, merged_into);
            CREATE INDEX IF NOT EXISTS idx_statements_speaker_topic ON statements (speaker_topic_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_statements_unique
                ON statements (topic_id, speaker_key, quote_key, article_id)
                WHERE merged_into IS NULL;

            CREATE TABLE IF NOT EXISTS ingestions (
                article_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ingestions_state ON ingestions (state);

            CREATE TABLE IF NOT EXISTS capability_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                task TEXT NOT NULL,
                topic_id TEXT,
                outcome TEXT NOT NULL,
                retries INTEGER NOT NULL,
                detail TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_capability_calls_article ON capability_calls (article_id, attempt);
            "#,
        )
        .execute(&mut *conn)
        .await?;

        info!(target: TARGET_DB, "Database schema initialized");
        Ok(())
    }
}
