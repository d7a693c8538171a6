use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, instrument};

use super::core::{format_date, format_timestamp, parse_date, parse_timestamp, Database};
use crate::model::{Event, EventDetails, EventId, EventTime, Precision, Provenance, TopicId};
use crate::TARGET_DB;

fn event_time_from_row(row: &SqliteRow) -> Result<Option<EventTime>, sqlx::Error> {
    let start: Option<String> = row.try_get("event_start")?;
    let end: Option<String> = row.try_get("event_end")?;
    let precision: Option<String> = row.try_get("event_precision")?;

    match (start, end, precision) {
        (Some(start), Some(end), Some(precision)) => Ok(Some(EventTime {
            start: parse_date(&start)?,
            end: parse_date(&end)?,
            precision: precision
                .parse::<Precision>()
                .map_err(sqlx::Error::Protocol)?,
        })),
        (None, None, None) => Ok(None),
        _ => Err(sqlx::Error::Protocol(
            "event time columns are partially populated".into(),
        )),
    }
}

fn details_from_row(row: &SqliteRow) -> Result<EventDetails, sqlx::Error> {
    let participants: String = row.try_get("participants")?;
    Ok(EventDetails {
        event_type: row.try_get("event_type")?,
        participants: serde_json::from_str(&participants)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        location: row.try_get("location")?,
    })
}

fn participants_column(details: &EventDetails) -> Result<String, sqlx::Error> {
    serde_json::to_string(&details.participants).map_err(|e| sqlx::Error::Protocol(format!("could not encode participants: {}", e)))
}

fn event_from_row(row: &SqliteRow) -> Result<Event, sqlx::Error> {
    let report_time: String = row.try_get("report_time")?;
    let created_at: String = row.try_get("created_at")?;
    let merged_into: Option<String> = row.try_get("merged_into")?;
    Ok(Event {
        id: EventId::from(row.try_get::<String, _>("id")?),
        topic_id: TopicId::from(row.try_get::<String, _>("topic_id")?),
        description: row.try_get("description")?,
        event_time: event_time_from_row(row)?,
        report_time: parse_timestamp(&report_time)?,
        confidence: row.try_get("confidence")?,
        details: details_from_row(row)?,
        provenance: Vec::new(),
        created_at: parse_timestamp(&created_at)?,
        seq: row.try_get("seq")?,
        merged_into: merged_into.map(EventId::from),
    })
}

fn time_columns(time: &Option<EventTime>) -> (Option<String>, Option<String>, Option<String>) {
    match time {
        Some(t) => (
            Some(format_date(&t.start)),
            Some(format_date(&t.end)),
            Some(t.precision.to_string()),
        ),
        None => (None, None, None),
    }
}

impl Database {
    /// Active (not superseded) events of a topic in insertion order, with
    /// provenance ordered by report time.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn active_events(&self, topic_id: &TopicId) -> Result<Vec<Event>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT seq, id, topic_id, description, event_start, event_end, event_precision,
                   report_time, confidence, event_type, participants, location, created_at,
                   merged_into
            FROM events
            WHERE topic_id = ?1 AND merged_into IS NULL
            ORDER BY seq ASC
            "#,
        )
        .bind(topic_id.as_str())
        .fetch_all(self.pool())
        .await?;

        let mut events = rows.iter().map(event_from_row).collect::<Result<Vec<_>, _>>()?;

        let provenance_rows = sqlx::query_as::<_, (String, String, String)>(
            r#"
            SELECT p.event_id, p.article_id, p.report_time
            FROM event_provenance p
            JOIN events e ON e.id = p.event_id
            WHERE e.topic_id = ?1 AND e.merged_into IS NULL
            ORDER BY p.report_time ASC, p.article_id ASC
            "#,
        )
        .bind(topic_id.as_str())
        .fetch_all(self.pool())
        .await?;

        let mut provenance: HashMap<String, Vec<Provenance>> = HashMap::new();
        for (event_id, article_id, report_time) in provenance_rows {
            provenance.entry(event_id).or_default().push(Provenance {
                article_id,
                report_time: parse_timestamp(&report_time)?,
            });
        }
        for event in events.iter_mut() {
            event.provenance = provenance.remove(event.id.as_str()).unwrap_or_default();
        }

        Ok(events)
    }

    /// Inserts a new canonical event with its provenance. Returns the
    /// insertion sequence number.
    #[instrument(target = "db", level = "debug", skip(self, event), fields(event_id = %event.id))]
    pub async fn insert_event(&self, event: &Event) -> Result<i64, sqlx::Error> {
        let (start, end, precision) = time_columns(&event.event_time);
        let participants = participants_column(&event.details)?;
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (id, topic_id, description, event_start, event_end, event_precision,
                                report_time, confidence, event_type, participants, location,
                                created_at, merged_into)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL)
            "#,
        )
        .bind(event.id.as_str())
        .bind(event.topic_id.as_str())
        .bind(&event.description)
        .bind(start)
        .bind(end)
        .bind(precision)
        .bind(format_timestamp(&event.report_time))
        .bind(event.confidence)
        .bind(&event.details.event_type)
        .bind(participants)
        .bind(&event.details.location)
        .bind(format_timestamp(&event.created_at))
        .execute(&mut *tx)
        .await?;
        let seq = result.last_insert_rowid();

        let added_at = format_timestamp(&Utc::now());
        for entry in &event.provenance {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO event_provenance (event_id, article_id, report_time, added_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(event.id.as_str())
            .bind(&entry.article_id)
            .bind(format_timestamp(&entry.report_time))
            .bind(&added_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(target: TARGET_DB, "Inserted event {} (seq {})", event.id, seq);
        Ok(seq)
    }

    /// Writes the merged state of an existing event: its mutable attributes
    /// and any provenance entries it does not yet have. Optionally retires
    /// other events into it in the same transaction.
    #[instrument(target = "db", level = "debug", skip(self, event, retired), fields(event_id = %event.id))]
    pub async fn update_merged_event(
        &self,
        event: &Event,
        retired: &[EventId],
    ) -> Result<(), sqlx::Error> {
        let (start, end, precision) = time_columns(&event.event_time);
        let participants = participants_column(&event.details)?;
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE events
            SET event_start = ?2, event_end = ?3, event_precision = ?4,
                report_time = ?5, confidence = ?6,
                event_type = ?7, participants = ?8, location = ?9
            WHERE id = ?1 AND merged_into IS NULL
            "#,
        )
        .bind(event.id.as_str())
        .bind(start)
        .bind(end)
        .bind(precision)
        .bind(format_timestamp(&event.report_time))
        .bind(event.confidence)
        .bind(&event.details.event_type)
        .bind(participants)
        .bind(&event.details.location)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(sqlx::Error::RowNotFound);
        }

        let added_at = format_timestamp(&Utc::now());
        for entry in &event.provenance {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO event_provenance (event_id, article_id, report_time, added_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(event.id.as_str())
            .bind(&entry.article_id)
            .bind(format_timestamp(&entry.report_time))
            .bind(&added_at)
            .execute(&mut *tx)
            .await?;
        }

        for retired_id in retired {
            sqlx::query("UPDATE events SET merged_into = ?1 WHERE id = ?2 AND merged_into IS NULL")
                .bind(event.id.as_str())
                .bind(retired_id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topic;
    use chrono::{NaiveDate, TimeZone};

    async fn seeded() -> (Database, TopicId) {
        let db = Database::in_memory().await.unwrap();
        let topic = Topic {
            id: TopicId::from("t-1"),
            name: "City Council".into(),
            aliases: vec!["City Council".into()],
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            redirect_to: None,
        };
        db.insert_topic(&topic, "city council").await.unwrap();
        (db, topic.id)
    }

    fn event(topic_id: &TopicId, article: &str, day: u32) -> Event {
        let report_time = Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap();
        Event {
            id: EventId::generate(),
            topic_id: topic_id.clone(),
            description: "Budget approved".into(),
            event_time: EventTime::month(2024, 1),
            report_time,
            confidence: 0.7,
            details: EventDetails::default(),
            provenance: vec![Provenance {
                article_id: article.into(),
                report_time,
            }],
            created_at: report_time,
            seq: 0,
            merged_into: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_merge_event() {
        let (db, topic_id) = seeded().await;
        let mut first = event(&topic_id, "a", 10);
        first.details.event_type = Some("vote".into());
        first.details.participants = vec!["City Council".into()];
        first.seq = db.insert_event(&first).await.unwrap();
        assert_eq!(db.active_events(&topic_id).await.unwrap()[0].details, first.details);

        let second = event(&topic_id, "b", 12);
        db.insert_event(&second).await.unwrap();

        first.provenance.push(second.provenance[0].clone());
        first.event_time = Some(EventTime::day(NaiveDate::from_ymd_opt(2024, 1, 9).unwrap()));
        first.confidence = 0.9;
        first.details.participants.push("Mayor Ana Lee".into());
        first.details.location = Some("City Hall".into());
        db.update_merged_event(&first, &[second.id.clone()]).await.unwrap();

        let events = db.active_events(&topic_id).await.unwrap();
        assert_eq!(events.len(), 1);
        let stored = &events[0];
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.article_ids(), vec!["a", "b"]);
        assert_eq!(stored.event_time.unwrap().precision, Precision::Day);
        assert_eq!(stored.confidence, 0.9);
        assert_eq!(stored.details, first.details);
        // the retired event keeps its own provenance row
        let citing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM event_provenance WHERE article_id = 'b'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(citing, 2);
    }

    #[tokio::test]
    async fn test_update_of_retired_event_fails() {
        let (db, topic_id) = seeded().await;
        let keeper = event(&topic_id, "a", 10);
        let retired = event(&topic_id, "b", 11);
        db.insert_event(&keeper).await.unwrap();
        db.insert_event(&retired).await.unwrap();
        db.update_merged_event(&keeper, &[retired.id.clone()]).await.unwrap();

        let err = db.update_merged_event(&retired, &[]).await.unwrap_err();
        assert!(matches!(err, sqlx::Error::RowNotFound));
    }
}
