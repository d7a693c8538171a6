use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{format_timestamp, parse_timestamp, Database};
use crate::extract::capability::TaskKind;
use crate::ingest::state::IngestionState;
use crate::model::TopicId;
use crate::retry::CallOutcome;
use crate::TARGET_DB;

#[derive(Debug, Clone, PartialEq)]
pub struct IngestionRecord {
    pub article_id: String,
    pub state: IngestionState,
    pub attempts: i64,
    /// Serialized result of the last finished attempt.
    pub result: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One capability call made on behalf of an article.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub article_id: String,
    pub attempt: i64,
    pub task: TaskKind,
    pub topic_id: Option<TopicId>,
    pub outcome: CallOutcome,
    pub retries: u32,
    pub detail: Option<String>,
}

impl Database {
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn get_ingestion(&self, article_id: &str) -> Result<Option<IngestionRecord>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT article_id, state, attempts, result, error, updated_at FROM ingestions WHERE article_id = ?1",
        )
        .bind(article_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Some(IngestionRecord {
            article_id: row.try_get("article_id")?,
            state: state.parse().map_err(sqlx::Error::Protocol)?,
            attempts: row.try_get("attempts")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    /// Starts a new attempt for an article, resetting it to `New`. Returns the
    /// attempt number, starting at 1.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn begin_ingestion(&self, article_id: &str) -> Result<i64, sqlx::Error> {
        let (attempts,) = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO ingestions (article_id, state, attempts, result, error, updated_at)
            VALUES (?1, ?2, 1, NULL, NULL, ?3)
            ON CONFLICT(article_id) DO UPDATE SET
                state = excluded.state,
                attempts = ingestions.attempts + 1,
                error = NULL,
                updated_at = excluded.updated_at
            RETURNING attempts
            "#,
        )
        .bind(article_id)
        .bind(IngestionState::New.as_str())
        .bind(format_timestamp(&Utc::now()))
        .fetch_one(self.pool())
        .await?;

        debug!(target: TARGET_DB, "Ingestion attempt {} for article {}", attempts, article_id);
        Ok(attempts)
    }

    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn set_ingestion_state(
        &self,
        article_id: &str,
        state: IngestionState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE ingestions SET state = ?2, updated_at = ?3 WHERE article_id = ?1")
            .bind(article_id)
            .bind(state.as_str())
            .bind(format_timestamp(&Utc::now()))
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Records the terminal state and result of the current attempt.
    #[instrument(target = "db", level = "debug", skip(self, result))]
    pub async fn finish_ingestion(
        &self,
        article_id: &str,
        state: IngestionState,
        result: &str,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE ingestions SET state = ?2, result = ?3, error = ?4, updated_at = ?5 WHERE article_id = ?1",
        )
        .bind(article_id)
        .bind(state.as_str())
        .bind(result)
        .bind(error)
        .bind(format_timestamp(&Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    #[instrument(target = "db", level = "debug", skip(self, call), fields(article_id = %call.article_id, task = %call.task))]
    pub async fn record_call(&self, call: &CallRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO capability_calls (article_id, attempt, task, topic_id, outcome, retries, detail, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&call.article_id)
        .bind(call.attempt)
        .bind(call.task.as_str())
        .bind(call.topic_id.as_ref().map(|id| id.as_str()))
        .bind(call.outcome.as_str())
        .bind(call.retries as i64)
        .bind(&call.detail)
        .bind(format_timestamp(&Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Calls recorded for an article, across all attempts, in call order.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn calls_for_article(&self, article_id: &str) -> Result<Vec<CallRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT article_id, attempt, task, topic_id, outcome, retries, detail
            FROM capability_calls
            WHERE article_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(article_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let task: String = row.try_get("task")?;
                let outcome: String = row.try_get("outcome")?;
                let topic_id: Option<String> = row.try_get("topic_id")?;
                let retries: i64 = row.try_get("retries")?;
                Ok(CallRecord {
                    article_id: row.try_get("article_id")?,
                    attempt: row.try_get("attempt")?,
                    task: task.parse().map_err(sqlx::Error::Protocol)?,
                    topic_id: topic_id.map(TopicId::from),
                    outcome: outcome.parse().map_err(sqlx::Error::Protocol)?,
                    retries: u32::try_from(retries).unwrap_or(u32::MAX),
                    detail: row.try_get("detail")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attempts_increment() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(db.begin_ingestion("a-1").await.unwrap(), 1);
        db.set_ingestion_state("a-1", IngestionState::Extracting).await.unwrap();
        db.finish_ingestion("a-1", IngestionState::Failed, "{}", Some("cancelled"))
            .await
            .unwrap();

        assert_eq!(db.begin_ingestion("a-1").await.unwrap(), 2);
        let record = db.get_ingestion("a-1").await.unwrap().unwrap();
        assert_eq!(record.state, IngestionState::New);
        assert_eq!(record.attempts, 2);
        assert!(record.error.is_none());
        // the last finished result survives until the next one is written
        assert_eq!(record.result.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_calls_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let call = CallRecord {
            article_id: "a-1".into(),
            attempt: 1,
            task: TaskKind::EventExtraction,
            topic_id: Some(TopicId::from("t-1")),
            outcome: CallOutcome::SoftFailure,
            retries: 4,
            detail: Some("rate limited".into()),
        };
        db.record_call(&call).await.unwrap();
        assert_eq!(db.calls_for_article("a-1").await.unwrap(), vec![call]);
    }
}
