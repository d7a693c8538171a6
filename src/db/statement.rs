use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{format_timestamp, parse_timestamp, Database};
use crate::model::{Speaker, Stance, Statement, StatementId, TopicId};
use crate::normalize::normalize_quote;
use crate::TARGET_DB;

fn statement_from_row(row: &SqliteRow) -> Result<Statement, sqlx::Error> {
    let report_time: String = row.try_get("report_time")?;
    let stance: String = row.try_get("stance")?;
    let speaker_topic_id: Option<String> = row.try_get("speaker_topic_id")?;
    let merged_into: Option<String> = row.try_get("merged_into")?;
    Ok(Statement {
        id: StatementId::from(row.try_get::<String, _>("id")?),
        topic_id: TopicId::from(row.try_get::<String, _>("topic_id")?),
        speaker: Speaker {
            name: row.try_get("speaker_name")?,
            topic_id: speaker_topic_id.map(TopicId::from),
        },
        speaker_role: row.try_get("speaker_role")?,
        quote: row.try_get("quote")?,
        stance: Stance::from(stance.as_str()),
        article_id: row.try_get("article_id")?,
        report_time: parse_timestamp(&report_time)?,
        seq: row.try_get("seq")?,
        merged_into: merged_into.map(StatementId::from),
    })
}

impl Database {
    /// Inserts a statement unless an active statement with the same
    /// (topic, speaker, normalized quote, article) key exists. Returns the
    /// insertion sequence number, or `None` for a duplicate.
    #[instrument(target = "db", level = "debug", skip(self, statement), fields(statement_id = %statement.id))]
    pub async fn insert_statement(&self, statement: &Statement) -> Result<Option<i64>, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO statements (
                id, topic_id, speaker_name, speaker_topic_id, speaker_key, speaker_role,
                quote, quote_key, stance, article_id, report_time, created_at, merged_into
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL)
            "#,
        )
        .bind(statement.id.as_str())
        .bind(statement.topic_id.as_str())
        .bind(&statement.speaker.name)
        .bind(statement.speaker.topic_id.as_ref().map(|id| id.as_str()))
        .bind(statement.speaker.key())
        .bind(&statement.speaker_role)
        .bind(&statement.quote)
        .bind(normalize_quote(&statement.quote))
        .bind(statement.stance.as_str())
        .bind(&statement.article_id)
        .bind(format_timestamp(&statement.report_time))
        .bind(format_timestamp(&chrono::Utc::now()))
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 1 {
            Ok(Some(result.last_insert_rowid()))
        } else {
            debug!(target: TARGET_DB, "Duplicate statement from article {}", statement.article_id);
            Ok(None)
        }
    }

    /// Active statements of a topic in insertion order.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn active_statements(&self, topic_id: &TopicId) -> Result<Vec<Statement>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT seq, id, topic_id, speaker_name, speaker_topic_id, speaker_role, quote, stance,
                   article_id, report_time, merged_into
            FROM statements
            WHERE topic_id = ?1 AND merged_into IS NULL
            ORDER BY seq ASC
            "#,
        )
        .bind(topic_id.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(statement_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topic;
    use chrono::{TimeZone, Utc};

    fn statement(topic_id: &TopicId, quote: &str) -> Statement {
        Statement {
            id: StatementId::generate(),
            topic_id: topic_id.clone(),
            speaker: Speaker::named("Mayor Lee"),
            speaker_role: Some("mayor".into()),
            quote: quote.into(),
            stance: Stance::Supportive,
            article_id: "a-1".into(),
            report_time: Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
            seq: 0,
            merged_into: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_quote_is_ignored() {
        let db = Database::in_memory().await.unwrap();
        let topic = Topic {
            id: TopicId::from("t-1"),
            name: "Budget".into(),
            aliases: vec![],
            created_at: Utc::now(),
            redirect_to: None,
        };
        db.insert_topic(&topic, "budget").await.unwrap();

        assert!(db
            .insert_statement(&statement(&topic.id, "We balanced the budget."))
            .await
            .unwrap()
            .is_some());
        // same words, different punctuation and case
        assert!(db
            .insert_statement(&statement(&topic.id, "we balanced the budget"))
            .await
            .unwrap()
            .is_none());

        let stored = db.active_statements(&topic.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].speaker_role.as_deref(), Some("mayor"));
    }
}
