//! Folding extracted candidates into a topic's canonical timeline.
//!
//! Callers hold the topic lock (see [`crate::locks`]) for the duration of a
//! reconciliation, so the active events loaded at the start stay current.

pub mod similarity;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ReconcileConfig;
use crate::db::Database;
use crate::error::{DataIntegrityError, ReconcileError, ReconciliationError};
use crate::model::{
    Event, EventCandidate, EventDetails, EventId, EventTime, Provenance, Statement, StatementCandidate,
    StatementId, TopicId,
};
use crate::TARGET_RECONCILE;

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub events_created: usize,
    pub events_merged: usize,
    pub statements_created: usize,
    pub statements_deduplicated: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ReconciliationError>,
}

impl ReconcileSummary {
    pub fn absorb(&mut self, other: ReconcileSummary) {
        self.events_created += other.events_created;
        self.events_merged += other.events_merged;
        self.statements_created += other.statements_created;
        self.statements_deduplicated += other.statements_deduplicated;
        self.errors.extend(other.errors);
    }
}

/// Folds another report of the same event into `target`.
///
/// Provenance and participants are unioned, confidence is the maximum, the
/// event time is only replaced by a strictly more precise one, and the report
/// time stays the earliest one seen.
fn fold_into(
    target: &mut Event,
    event_time: Option<&EventTime>,
    confidence: f64,
    details: &EventDetails,
    provenance: &[Provenance],
) {
    for entry in provenance {
        if !target.supported_by(&entry.article_id) {
            target.provenance.push(entry.clone());
        }
    }
    target.provenance.sort_by_key(|p| p.report_time);

    target.confidence = target.confidence.max(confidence);
    target.details.absorb(details);

    target.event_time = match (target.event_time, event_time) {
        (None, Some(incoming)) => Some(*incoming),
        (Some(current), Some(incoming)) if incoming.is_more_precise_than(&current) => Some(*incoming),
        (current, _) => current,
    };

    if let Some(earliest) = target.provenance.iter().map(|p| p.report_time).min() {
        target.report_time = target.report_time.min(earliest);
    }
}

#[derive(Clone)]
pub struct Reconciler {
    db: Database,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(db: Database, config: ReconcileConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    async fn integrity_failure(
        &self,
        topic_id: &TopicId,
        detail: String,
    ) -> Result<ReconcileError, ReconcileError> {
        error!(target: TARGET_RECONCILE, "Quarantining topic {}: {}", topic_id, detail);
        self.db.quarantine_topic(topic_id, &detail).await?;
        Ok(DataIntegrityError {
            topic_id: topic_id.clone(),
            detail,
        }
        .into())
    }

    /// Confirms the topic can take writes. Returns the redirect target when
    /// the topic has been merged away since the caller resolved it.
    async fn check_topic(&self, topic_id: &TopicId) -> Result<Option<TopicId>, ReconcileError> {
        if let Some(reason) = self.db.topic_quarantine(topic_id).await? {
            return Err(DataIntegrityError {
                topic_id: topic_id.clone(),
                detail: format!("topic is quarantined: {}", reason),
            }
            .into());
        }

        match self.db.get_topic(topic_id).await? {
            Some(topic) => Ok(topic.redirect_to),
            None => Err(self
                .integrity_failure(topic_id, "topic missing from store".to_string())
                .await?),
        }
    }

    fn rejected(topic_id: &TopicId, candidate: &str, reason: impl Into<String>) -> ReconciliationError {
        let error = ReconciliationError {
            topic_id: topic_id.clone(),
            candidate: candidate.to_string(),
            reason: reason.into(),
        };
        warn!(target: TARGET_RECONCILE, "{}", error);
        error
    }

    /// Merges each candidate into the most similar active event of the topic,
    /// or inserts it as a new event.
    #[instrument(target = "reconcile", skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn reconcile_events(
        &self,
        topic_id: &TopicId,
        candidates: Vec<EventCandidate>,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let mut summary = ReconcileSummary::default();
        if candidates.is_empty() {
            return Ok(summary);
        }

        if let Some(survivor) = self.check_topic(topic_id).await? {
            summary.errors = candidates
                .iter()
                .map(|c| {
                    Self::rejected(topic_id, &c.description, format!("topic was merged into {}", survivor))
                })
                .collect();
            return Ok(summary);
        }

        let mut existing = self.db.active_events(topic_id).await?;

        for candidate in candidates {
            if candidate.topic_id != *topic_id {
                summary.errors.push(Self::rejected(
                    topic_id,
                    &candidate.description,
                    format!("candidate belongs to topic {}", candidate.topic_id),
                ));
                continue;
            }

            let provenance = [Provenance {
                article_id: candidate.article_id.clone(),
                report_time: candidate.report_time,
            }];

            match similarity::best_match(
                &candidate.description,
                candidate.event_time.as_ref(),
                &existing,
                &self.config,
            ) {
                Some((index, score)) => {
                    let mut merged = existing[index].clone();
                    fold_into(
                        &mut merged,
                        candidate.event_time.as_ref(),
                        candidate.confidence,
                        &candidate.details,
                        &provenance,
                    );

                    match self.db.update_merged_event(&merged, &[]).await {
                        Ok(()) => {
                            debug!(
                                target: TARGET_RECONCILE,
                                "Merged '{}' into event {} (text {:.2}, time {:.2}, combined {:.2})",
                                candidate.description, merged.id, score.text, score.temporal, score.combined
                            );
                            existing[index] = merged;
                            summary.events_merged += 1;
                        }
                        Err(sqlx::Error::RowNotFound) => {
                            summary.errors.push(Self::rejected(
                                topic_id,
                                &candidate.description,
                                format!("event {} is no longer active", merged.id),
                            ));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                None => {
                    let mut event = Event {
                        id: EventId::generate(),
                        topic_id: topic_id.clone(),
                        description: candidate.description,
                        event_time: candidate.event_time,
                        report_time: candidate.report_time,
                        confidence: candidate.confidence,
                        details: candidate.details,
                        provenance: provenance.to_vec(),
                        created_at: Utc::now(),
                        seq: 0,
                        merged_into: None,
                    };
                    event.seq = self.db.insert_event(&event).await?;
                    debug!(target: TARGET_RECONCILE, "Created event {} '{}'", event.id, event.description);
                    existing.push(event);
                    summary.events_created += 1;
                }
            }
        }

        info!(
            target: TARGET_RECONCILE,
            "Topic {}: {} events created, {} merged, {} rejected",
            topic_id, summary.events_created, summary.events_merged, summary.errors.len()
        );
        Ok(summary)
    }

    /// Inserts statements, skipping any whose uniqueness key is already taken.
    #[instrument(target = "reconcile", skip(self, candidates), fields(candidates = candidates.len()))]
    pub async fn reconcile_statements(
        &self,
        topic_id: &TopicId,
        candidates: Vec<StatementCandidate>,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let mut summary = ReconcileSummary::default();
        if candidates.is_empty() {
            return Ok(summary);
        }

        if let Some(survivor) = self.check_topic(topic_id).await? {
            summary.errors = candidates
                .iter()
                .map(|c| Self::rejected(topic_id, &c.quote, format!("topic was merged into {}", survivor)))
                .collect();
            return Ok(summary);
        }

        for candidate in candidates {
            if candidate.topic_id != *topic_id {
                summary.errors.push(Self::rejected(
                    topic_id,
                    &candidate.quote,
                    format!("candidate belongs to topic {}", candidate.topic_id),
                ));
                continue;
            }

            let statement = Statement {
                id: StatementId::generate(),
                topic_id: topic_id.clone(),
                speaker: candidate.speaker,
                speaker_role: candidate.speaker_role,
                quote: candidate.quote,
                stance: candidate.stance,
                article_id: candidate.article_id,
                report_time: candidate.report_time,
                seq: 0,
                merged_into: None,
            };
            match self.db.insert_statement(&statement).await? {
                Some(_) => summary.statements_created += 1,
                None => summary.statements_deduplicated += 1,
            }
        }

        info!(
            target: TARGET_RECONCILE,
            "Topic {}: {} statements created, {} duplicates",
            topic_id, summary.statements_created, summary.statements_deduplicated
        );
        Ok(summary)
    }

    /// Folds duplicate active events of a topic into the earliest matching
    /// one. Used after a topic merge brings two timelines together.
    #[instrument(target = "reconcile", skip(self))]
    pub async fn consolidate_topic(&self, topic_id: &TopicId) -> Result<ReconcileSummary, ReconcileError> {
        let mut summary = ReconcileSummary::default();
        if self.check_topic(topic_id).await?.is_some() {
            return Ok(summary);
        }

        let mut kept: Vec<Event> = Vec::new();
        for event in self.db.active_events(topic_id).await? {
            let Some((index, _)) =
                similarity::best_match(&event.description, event.event_time.as_ref(), &kept, &self.config)
            else {
                kept.push(event);
                continue;
            };

            let mut survivor = kept[index].clone();
            fold_into(
                &mut survivor,
                event.event_time.as_ref(),
                event.confidence,
                &event.details,
                &event.provenance,
            );
            match self.db.update_merged_event(&survivor, std::slice::from_ref(&event.id)).await {
                Ok(()) => {
                    debug!(target: TARGET_RECONCILE, "Folded event {} into {}", event.id, survivor.id);
                    kept[index] = survivor;
                    summary.events_merged += 1;
                }
                Err(sqlx::Error::RowNotFound) => {
                    summary.errors.push(Self::rejected(
                        topic_id,
                        &event.description,
                        format!("event {} is no longer active", survivor.id),
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(target: TARGET_RECONCILE, "Consolidated topic {}: {} events folded", topic_id, summary.events_merged);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Speaker, Stance, Topic};
    use chrono::{DateTime, TimeZone};

    async fn setup() -> (Database, Reconciler, TopicId) {
        let db = Database::in_memory().await.unwrap();
        let topic = Topic {
            id: TopicId::from("t-council"),
            name: "City Council".into(),
            aliases: vec!["City Council".into()],
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            redirect_to: None,
        };
        db.insert_topic(&topic, "city council").await.unwrap();
        let reconciler = Reconciler::new(db.clone(), ReconcileConfig::default());
        (db, reconciler, topic.id)
    }

    fn published(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, month, day, 8, 0, 0).unwrap()
    }

    fn candidate(
        topic_id: &TopicId,
        article: &str,
        description: &str,
        event_time: Option<EventTime>,
        report_time: DateTime<Utc>,
        confidence: f64,
    ) -> EventCandidate {
        EventCandidate {
            topic_id: topic_id.clone(),
            article_id: article.into(),
            description: description.into(),
            event_time,
            report_time,
            confidence,
            details: EventDetails::default(),
        }
    }

    #[test]
    fn test_fold_keeps_precise_time_and_earliest_report() {
        let jan = published(1, 10);
        let feb = published(2, 5);
        let mut event = Event {
            id: EventId::from("e-1"),
            topic_id: TopicId::from("t"),
            description: "Budget approved".into(),
            event_time: EventTime::month(2024, 1),
            report_time: feb,
            confidence: 0.6,
            details: EventDetails::default(),
            provenance: vec![Provenance {
                article_id: "b".into(),
                report_time: feb,
            }],
            created_at: feb,
            seq: 1,
            merged_into: None,
        };

        let year = EventTime::year(2024);
        fold_into(
            &mut event,
            year.as_ref(),
            0.9,
            &EventDetails::default(),
            &[Provenance {
                article_id: "a".into(),
                report_time: jan,
            }],
        );
        assert_eq!(event.event_time, EventTime::month(2024, 1));
        assert_eq!(event.confidence, 0.9);
        assert_eq!(event.report_time, jan);
        assert_eq!(event.article_ids(), vec!["a", "b"]);

        let day = chrono::NaiveDate::from_ymd_opt(2024, 1, 9).map(EventTime::day);
        fold_into(&mut event, day.as_ref(), 0.1, &EventDetails::default(), &[]);
        assert_eq!(event.event_time, day);
        assert_eq!(event.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_dedup_threshold() {
        let (db, reconciler, topic_id) = setup().await;
        let summary = reconciler
            .reconcile_events(
                &topic_id,
                vec![
                    candidate(&topic_id, "a", "Council approved the budget", EventTime::month(2024, 1), published(1, 10), 0.8),
                    candidate(&topic_id, "a", "Library reopened downtown", EventTime::month(2023, 6), published(1, 10), 0.7),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.events_created, 2);

        let summary = reconciler
            .reconcile_events(
                &topic_id,
                vec![candidate(&topic_id, "b", "Budget approved by the council", EventTime::month(2024, 1), published(2, 1), 0.6)],
            )
            .await
            .unwrap();
        assert_eq!(summary.events_merged, 1);
        assert_eq!(summary.events_created, 0);

        let events = db.active_events(&topic_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].article_ids(), vec!["a", "b"]);
        assert_eq!(events[0].confidence, 0.8);
        assert_eq!(events[0].report_time, published(1, 10));
    }

    #[tokio::test]
    async fn test_statement_dedup() {
        let (db, reconciler, topic_id) = setup().await;
        let statement = StatementCandidate {
            topic_id: topic_id.clone(),
            article_id: "a".into(),
            speaker: Speaker::named("Mayor Lee"),
            speaker_role: Some("Mayor".into()),
            quote: "We will balance the budget.".into(),
            stance: Stance::Supportive,
            report_time: published(1, 10),
        };
        let mut repeated = statement.clone();
        repeated.quote = "We will balance the budget".into();

        let summary = reconciler
            .reconcile_statements(&topic_id, vec![statement, repeated])
            .await
            .unwrap();
        assert_eq!(summary.statements_created, 1);
        assert_eq!(summary.statements_deduplicated, 1);
        assert_eq!(db.active_statements(&topic_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_topic_is_quarantined() {
        let (db, reconciler, _) = setup().await;
        let ghost = TopicId::from("t-ghost");
        let err = reconciler
            .reconcile_events(
                &ghost,
                vec![candidate(&ghost, "a", "Something happened", None, published(1, 10), 0.5)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Integrity(_)));
        assert!(db.topic_quarantine(&ghost).await.unwrap().is_some());

        // fails fast from now on
        let err = reconciler
            .reconcile_statements(
                &ghost,
                vec![StatementCandidate {
                    topic_id: ghost.clone(),
                    article_id: "a".into(),
                    speaker: Speaker::named("Someone"),
                    speaker_role: None,
                    quote: "Hello".into(),
                    stance: Stance::Unclear,
                    report_time: published(1, 10),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_foreign_candidate_is_recoverable() {
        let (db, reconciler, topic_id) = setup().await;
        let other = TopicId::from("t-other");
        let summary = reconciler
            .reconcile_events(
                &topic_id,
                vec![
                    candidate(&other, "a", "Stray event", None, published(1, 10), 0.5),
                    candidate(&topic_id, "a", "Council met", None, published(1, 10), 0.5),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.events_created, 1);
        assert_eq!(db.active_events(&topic_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_consolidate_after_merge() {
        let (db, reconciler, topic_id) = setup().await;
        for (article, day) in [("a", 10), ("b", 12)] {
            let event = Event {
                id: EventId::generate(),
                topic_id: topic_id.clone(),
                description: "Council approved the budget".into(),
                event_time: EventTime::month(2024, 1),
                report_time: published(1, day),
                confidence: 0.5,
                details: EventDetails::default(),
                provenance: vec![Provenance {
                    article_id: article.into(),
                    report_time: published(1, day),
                }],
                created_at: Utc::now(),
                seq: 0,
                merged_into: None,
            };
            db.insert_event(&event).await.unwrap();
        }

        let summary = reconciler.consolidate_topic(&topic_id).await.unwrap();
        assert_eq!(summary.events_merged, 1);

        let events = db.active_events(&topic_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].article_ids(), vec!["a", "b"]);
        assert_eq!(events[0].report_time, published(1, 10));
    }
}
