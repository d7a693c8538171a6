//! Read-only projection of a topic's reconciled record, in the shape the
//! external generation step consumes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{FeedError, RegistryError};
use crate::locks::KeyedLocks;
use crate::model::{Event, Stance, Statement, Topic, TopicId};
use crate::topic::TopicRegistry;
use crate::TARGET_TOPIC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimelineOrder {
    /// When things happened. Events without a known time sit at their report date.
    EventTime,
    /// When things were first reported.
    ReportTime,
}

impl fmt::Display for TimelineOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimelineOrder::EventTime => write!(f, "event-time"),
            TimelineOrder::ReportTime => write!(f, "report-time"),
        }
    }
}

impl FromStr for TimelineOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event-time" | "event" => Ok(TimelineOrder::EventTime),
            "report-time" | "report" => Ok(TimelineOrder::ReportTime),
            other => Err(format!("unknown timeline order '{}'", other)),
        }
    }
}

fn event_time_key(event: &Event) -> NaiveDate {
    event
        .event_time
        .map(|t| t.start)
        .unwrap_or_else(|| event.report_time.date_naive())
}

/// Sorts a seq-ordered list; the sort is stable, so equal keys keep
/// insertion order.
fn order_events(mut events: Vec<Event>, order: TimelineOrder) -> Vec<Event> {
    match order {
        TimelineOrder::EventTime => events.sort_by_key(event_time_key),
        TimelineOrder::ReportTime => events.sort_by_key(|e| e.report_time),
    }
    events
}

fn group_by_stance(statements: Vec<Statement>) -> BTreeMap<Stance, Vec<Statement>> {
    let mut grouped: BTreeMap<Stance, Vec<Statement>> = BTreeMap::new();
    for statement in statements {
        grouped.entry(statement.stance).or_default().push(statement);
    }
    grouped
}

/// Everything the generation step needs for one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisInput {
    pub topic: Topic,
    pub generated_at: DateTime<Utc>,
    pub by_event_time: Vec<Event>,
    pub by_report_time: Vec<Event>,
    pub statements: BTreeMap<Stance, Vec<Statement>>,
}

#[derive(Clone)]
pub struct SynthesisFeed {
    db: Database,
    registry: TopicRegistry,
    locks: KeyedLocks,
}

impl SynthesisFeed {
    pub fn new(db: Database, registry: TopicRegistry, locks: KeyedLocks) -> Self {
        Self { db, registry, locks }
    }

    async fn canonical_topic(&self, topic_id: &TopicId) -> Result<Topic, FeedError> {
        let canonical = self.registry.canonical(topic_id).await?;
        if &canonical != topic_id {
            debug!(target: TARGET_TOPIC, "Topic {} redirects to {}", topic_id, canonical);
        }
        match self.db.get_topic(&canonical).await? {
            Some(topic) => Ok(topic),
            None => Err(RegistryError::UnknownTopic(canonical).into()),
        }
    }

    /// Active events of a topic (or of the topic it was merged into).
    #[instrument(level = "debug", skip(self))]
    pub async fn get_timeline(&self, topic_id: &TopicId, order: TimelineOrder) -> Result<Vec<Event>, FeedError> {
        let topic = self.canonical_topic(topic_id).await?;
        let _guard = self.locks.lock_topic(&topic.id).await;
        let events = self.db.active_events(&topic.id).await?;
        Ok(order_events(events, order))
    }

    /// Active statements grouped by stance, each group in insertion order.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_statements(&self, topic_id: &TopicId) -> Result<BTreeMap<Stance, Vec<Statement>>, FeedError> {
        let topic = self.canonical_topic(topic_id).await?;
        let _guard = self.locks.lock_topic(&topic.id).await;
        Ok(group_by_stance(self.db.active_statements(&topic.id).await?))
    }

    /// Both timelines and the grouped statements, read under one lock so they
    /// reflect the same reconciliation.
    pub async fn synthesis_input(&self, topic_id: &TopicId) -> Result<SynthesisInput, FeedError> {
        let topic = self.canonical_topic(topic_id).await?;
        let _guard = self.locks.lock_topic(&topic.id).await;
        let events = self.db.active_events(&topic.id).await?;
        let statements = self.db.active_statements(&topic.id).await?;

        Ok(SynthesisInput {
            by_event_time: order_events(events.clone(), TimelineOrder::EventTime),
            by_report_time: order_events(events, TimelineOrder::ReportTime),
            statements: group_by_stance(statements),
            generated_at: Utc::now(),
            topic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchConfig;
    use crate::model::{EventDetails, EventId, EventTime, Provenance, Speaker, StatementId};
    use crate::topic::ResolveContext;
    use chrono::TimeZone;

    fn event(topic_id: &TopicId, description: &str, time: Option<EventTime>, reported: DateTime<Utc>) -> Event {
        Event {
            id: EventId::generate(),
            topic_id: topic_id.clone(),
            description: description.into(),
            event_time: time,
            report_time: reported,
            confidence: 0.8,
            details: EventDetails::default(),
            provenance: vec![Provenance {
                article_id: format!("article-{}", description),
                report_time: reported,
            }],
            created_at: Utc::now(),
            seq: 0,
            merged_into: None,
        }
    }

    async fn feed_with_topic() -> (SynthesisFeed, Database, TopicId) {
        let db = Database::in_memory().await.unwrap();
        let locks = KeyedLocks::new();
        let registry = TopicRegistry::new(db.clone(), &MatchConfig::default(), locks.clone());
        let topic_id = registry
            .resolve_or_create("Harbor Bridge", &ResolveContext::default())
            .await
            .unwrap();
        (SynthesisFeed::new(db.clone(), registry, locks), db, topic_id)
    }

    #[tokio::test]
    async fn test_two_orders_differ() {
        let (feed, db, topic_id) = feed_with_topic().await;
        let day = |m, d| Utc.with_ymd_and_hms(2024, m, d, 9, 0, 0).unwrap();

        // reported late about something long ago
        db.insert_event(&event(&topic_id, "retrospective", EventTime::year(2019), day(3, 1)))
            .await
            .unwrap();
        db.insert_event(&event(&topic_id, "closure", EventTime::month(2024, 1), day(1, 20)))
            .await
            .unwrap();
        db.insert_event(&event(&topic_id, "untimed", None, day(2, 10)))
            .await
            .unwrap();

        let by_event: Vec<_> = feed
            .get_timeline(&topic_id, TimelineOrder::EventTime)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.description)
            .collect();
        assert_eq!(by_event, vec!["retrospective", "closure", "untimed"]);

        let by_report: Vec<_> = feed
            .get_timeline(&topic_id, TimelineOrder::ReportTime)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.description)
            .collect();
        assert_eq!(by_report, vec!["closure", "untimed", "retrospective"]);
    }

    #[tokio::test]
    async fn test_ties_keep_insertion_order() {
        let (feed, db, topic_id) = feed_with_topic().await;
        let reported = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
        for name in ["first", "second", "third"] {
            db.insert_event(&event(&topic_id, name, EventTime::month(2024, 1), reported))
                .await
                .unwrap();
        }
        for order in [TimelineOrder::EventTime, TimelineOrder::ReportTime] {
            let names: Vec<_> = feed
                .get_timeline(&topic_id, order)
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.description)
                .collect();
            assert_eq!(names, vec!["first", "second", "third"]);
        }
    }

    #[tokio::test]
    async fn test_statements_grouped_and_unknown_topic() {
        let (feed, db, topic_id) = feed_with_topic().await;
        let reported = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
        for (quote, stance) in [
            ("Reopen it now", Stance::Supportive),
            ("Too expensive", Stance::Opposed),
            ("Finally", Stance::Supportive),
        ] {
            db.insert_statement(&Statement {
                id: StatementId::generate(),
                topic_id: topic_id.clone(),
                speaker: Speaker::named("Resident"),
                speaker_role: None,
                quote: quote.into(),
                stance,
                article_id: "a-1".into(),
                report_time: reported,
                seq: 0,
                merged_into: None,
            })
            .await
            .unwrap();
        }

        let grouped = feed.get_statements(&topic_id).await.unwrap();
        assert_eq!(grouped[&Stance::Supportive].len(), 2);
        assert_eq!(grouped[&Stance::Supportive][0].quote, "Reopen it now");
        assert_eq!(grouped[&Stance::Opposed].len(), 1);
        assert!(!grouped.contains_key(&Stance::Neutral));

        let input = feed.synthesis_input(&topic_id).await.unwrap();
        assert_eq!(input.topic.name, "Harbor Bridge");
        assert!(serde_json::to_value(&input).unwrap()["statements"]["supportive"].is_array());

        let missing = feed.get_timeline(&TopicId::from("nope"), TimelineOrder::EventTime).await;
        assert!(matches!(missing, Err(FeedError::Registry(RegistryError::UnknownTopic(_)))));
    }
}
