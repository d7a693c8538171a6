use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info, instrument};

use super::core::{format_timestamp, parse_timestamp, Database};
use crate::model::{Topic, TopicId};
use crate::TARGET_DB;

/// One alias of an active topic, as used for name matching.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasRow {
    pub topic_id: TopicId,
    pub alias: String,
    pub normalized_alias: String,
    pub topic_created_at: DateTime<Utc>,
}

/// What a topic merge rewrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicMergeCounts {
    pub aliases_added: u64,
    pub events_moved: u64,
    pub statements_moved: u64,
    pub statements_superseded: u64,
    pub redirects_compressed: u64,
}

fn topic_from_row(row: &SqliteRow) -> Result<Topic, sqlx::Error> {
    let created_at: String = row.try_get("created_at")?;
    let redirect_to: Option<String> = row.try_get("redirect_to")?;
    Ok(Topic {
        id: TopicId::from(row.try_get::<String, _>("id")?),
        name: row.try_get("name")?,
        aliases: Vec::new(),
        created_at: parse_timestamp(&created_at)?,
        redirect_to: redirect_to.map(TopicId::from),
    })
}

impl Database {
    /// Inserts a new topic together with its initial alias.
    #[instrument(target = "db", level = "info", skip(self, topic), fields(topic_id = %topic.id))]
    pub async fn insert_topic(
        &self,
        topic: &Topic,
        normalized_name: &str,
    ) -> Result<(), sqlx::Error> {
        let created_at = format_timestamp(&topic.created_at);
        let mut tx = self.pool().begin().await?;

        sqlx::query("INSERT INTO topics (id, name, created_at, redirect_to) VALUES (?1, ?2, ?3, NULL)")
            .bind(topic.id.as_str())
            .bind(&topic.name)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO topic_aliases (topic_id, alias, normalized_alias, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(topic.id.as_str())
        .bind(&topic.name)
        .bind(normalized_name)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: TARGET_DB, "Created topic '{}' ({})", topic.name, topic.id);
        Ok(())
    }

    /// Adds an alias unless its normalized form is already recorded for the
    /// topic. Returns whether a row was added.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn add_topic_alias(
        &self,
        topic_id: &TopicId,
        alias: &str,
        normalized_alias: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO topic_aliases (topic_id, alias, normalized_alias, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(topic_id.as_str())
        .bind(alias)
        .bind(normalized_alias)
        .bind(format_timestamp(&Utc::now()))
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn get_topic(&self, topic_id: &TopicId) -> Result<Option<Topic>, sqlx::Error> {
        let row = sqlx::query("SELECT id, name, created_at, redirect_to FROM topics WHERE id = ?1")
            .bind(topic_id.as_str())
            .fetch_optional(self.pool())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut topic = topic_from_row(&row)?;
        topic.aliases = self.topic_aliases(topic_id).await?;
        Ok(Some(topic))
    }

    /// Aliases in the order they were first seen.
    pub async fn topic_aliases(&self, topic_id: &TopicId) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT alias FROM topic_aliases WHERE topic_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(topic_id.as_str())
        .fetch_all(self.pool())
        .await
    }

    /// Where a topic redirects: `None` if the topic does not exist,
    /// `Some(None)` for a canonical topic.
    pub async fn topic_redirect(
        &self,
        topic_id: &TopicId,
    ) -> Result<Option<Option<TopicId>>, sqlx::Error> {
        let row = sqlx::query_as::<_, (Option<String>,)>("SELECT redirect_to FROM topics WHERE id = ?1")
            .bind(topic_id.as_str())
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|(redirect,)| redirect.map(TopicId::from)))
    }

    /// Canonical topics with their aliases, oldest first.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn list_topics(&self) -> Result<Vec<Topic>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, created_at, redirect_to FROM topics
            WHERE redirect_to IS NULL
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let mut topics = rows.iter().map(topic_from_row).collect::<Result<Vec<_>, _>>()?;
        for topic in topics.iter_mut() {
            topic.aliases = self.topic_aliases(&topic.id).await?;
        }
        Ok(topics)
    }

    /// Every alias of every canonical topic.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn active_aliases(&self) -> Result<Vec<AliasRow>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT a.topic_id, a.alias, a.normalized_alias, t.created_at
            FROM topic_aliases a
            JOIN topics t ON t.id = a.topic_id
            WHERE t.redirect_to IS NULL
            ORDER BY t.created_at ASC, t.id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let created_at: String = row.try_get("created_at")?;
                Ok(AliasRow {
                    topic_id: TopicId::from(row.try_get::<String, _>("topic_id")?),
                    alias: row.try_get("alias")?,
                    normalized_alias: row.try_get("normalized_alias")?,
                    topic_created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    /// Folds `loser` into `survivor` in one transaction: aliases are copied,
    /// events and statements re-pointed, colliding statements superseded, and
    /// the loser (plus anything already redirecting to it) redirected.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn merge_topics(
        &self,
        survivor: &TopicId,
        loser: &TopicId,
    ) -> Result<TopicMergeCounts, sqlx::Error> {
        let mut tx = self.pool().begin().await?;
        let mut counts = TopicMergeCounts::default();

        counts.aliases_added = sqlx::query(
            r#"
            INSERT OR IGNORE INTO topic_aliases (topic_id, alias, normalized_alias, created_at)
            SELECT ?1, alias, normalized_alias, created_at FROM topic_aliases WHERE topic_id = ?2
            "#,
        )
        .bind(survivor.as_str())
        .bind(loser.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        counts.events_moved = sqlx::query("UPDATE events SET topic_id = ?1 WHERE topic_id = ?2")
            .bind(survivor.as_str())
            .bind(loser.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let (moved, superseded) = move_statements(&mut tx, survivor, loser).await?;
        counts.statements_moved = moved;
        counts.statements_superseded = superseded;

        sqlx::query("UPDATE topics SET redirect_to = ?1 WHERE id = ?2")
            .bind(survivor.as_str())
            .bind(loser.as_str())
            .execute(&mut *tx)
            .await?;

        counts.redirects_compressed =
            sqlx::query("UPDATE topics SET redirect_to = ?1 WHERE redirect_to = ?2")
                .bind(survivor.as_str())
                .bind(loser.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();

        tx.commit().await?;
        info!(target: TARGET_DB, "Merged topic {} into {}: {:?}", loser, survivor, counts);
        Ok(counts)
    }

    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn quarantine_topic(&self, topic_id: &TopicId, reason: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO topic_quarantine (topic_id, reason, quarantined_at) VALUES (?1, ?2, ?3)",
        )
        .bind(topic_id.as_str())
        .bind(reason)
        .bind(format_timestamp(&Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// The quarantine reason, if the topic is quarantined.
    pub async fn topic_quarantine(&self, topic_id: &TopicId) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT reason FROM topic_quarantine WHERE topic_id = ?1")
            .bind(topic_id.as_str())
            .fetch_optional(self.pool())
            .await
    }

    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn clear_quarantine(&self, topic_id: &TopicId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM topic_quarantine WHERE topic_id = ?1")
            .bind(topic_id.as_str())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Re-points the loser's statements, and statements whose speaker is the
/// loser, at the survivor. A statement whose new uniqueness key is already
/// taken by an active statement is marked as merged into that one.
async fn move_statements(
    tx: &mut Transaction<'_, Sqlite>,
    survivor: &TopicId,
    loser: &TopicId,
) -> Result<(u64, u64), sqlx::Error> {
    let rows = sqlx::query_as::<_, (String, String, Option<String>, String, String, String)>(
        r#"
        SELECT id, topic_id, speaker_topic_id, speaker_key, quote_key, article_id
        FROM statements
        WHERE merged_into IS NULL AND (topic_id = ?1 OR speaker_topic_id = ?1)
        ORDER BY seq ASC
        "#,
    )
    .bind(loser.as_str())
    .fetch_all(&mut **tx)
    .await?;

    let (mut moved, mut superseded) = (0, 0);

    for (id, topic_id, speaker_topic_id, speaker_key, quote_key, article_id) in rows {
        let new_topic = if topic_id == loser.as_str() {
            survivor.as_str().to_string()
        } else {
            topic_id
        };
        let new_speaker_topic = if speaker_topic_id.as_deref() == Some(loser.as_str()) {
            Some(survivor.as_str().to_string())
        } else {
            speaker_topic_id
        };

        let existing = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id FROM statements
            WHERE merged_into IS NULL AND id != ?1
              AND topic_id = ?2 AND speaker_key = ?3 AND quote_key = ?4 AND article_id = ?5
            LIMIT 1
            "#,
        )
        .bind(&id)
        .bind(&new_topic)
        .bind(&speaker_key)
        .bind(&quote_key)
        .bind(&article_id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(existing_id) = &existing {
            // retire the row first so the re-pointed key stays unique
            sqlx::query("UPDATE statements SET merged_into = ?1 WHERE id = ?2")
                .bind(existing_id)
                .bind(&id)
                .execute(&mut **tx)
                .await?;
            debug!(target: TARGET_DB, "Statement {} superseded by {}", id, existing_id);
            superseded += 1;
        } else {
            moved += 1;
        }

        sqlx::query("UPDATE statements SET topic_id = ?1, speaker_topic_id = ?2 WHERE id = ?3")
            .bind(&new_topic)
            .bind(&new_speaker_topic)
            .bind(&id)
            .execute(&mut **tx)
            .await?;
    }

    // superseded rows are already retired; only their owner changes
    let retired = sqlx::query("UPDATE statements SET topic_id = ?1 WHERE topic_id = ?2 AND merged_into IS NOT NULL")
        .bind(survivor.as_str())
        .bind(loser.as_str())
        .execute(&mut **tx)
        .await?
        .rows_affected();
    debug!(target: TARGET_DB, "Re-pointed {} retired statements", retired);

    Ok((moved, superseded))
}
