use std::sync::Arc;
use tracing::{debug, info, warn};

use super::capability::{CapabilityRequest, TaskKind};
use super::schema::{parse_event_item, response_items};
use super::time_expr::parse_event_time;
use super::Extraction;
use crate::error::SoftExtractionFailure;
use crate::model::{Article, EventCandidate, EventDetails, Topic, TopicId};
use crate::retry::CallScheduler;
use crate::TARGET_INGEST;

const TASK: TaskKind = TaskKind::EventExtraction;

/// Validates an event-extraction response. Every valid item becomes a
/// candidate; an item whose time text cannot be resolved keeps no event time
/// and is also reported as a soft failure.
pub fn events_from_response(
    raw: &serde_json::Value,
    article: &Article,
    topic_id: &TopicId,
) -> (Vec<EventCandidate>, Vec<SoftExtractionFailure>) {
    let items = match response_items(raw, TASK) {
        Ok(items) => items,
        Err(failure) => return (Vec::new(), vec![failure]),
    };

    let mut candidates = Vec::with_capacity(items.len());
    let mut failures = Vec::new();

    for (index, value) in items.iter().enumerate() {
        let item = match parse_event_item(value) {
            Ok(item) => item,
            Err(reason) => {
                debug!(target: TARGET_INGEST, "Dropping event item {} of {}: {}", index, article.id, reason);
                failures.push(SoftExtractionFailure::item(TASK, index, reason));
                continue;
            }
        };

        let event_time = match item.event_time_text.as_deref() {
            Some(text) => {
                let parsed = parse_event_time(text, article.published_at);
                if parsed.is_none() {
                    failures.push(SoftExtractionFailure::item(
                        TASK,
                        index,
                        format!("unparseable event time '{}'", text),
                    ));
                }
                parsed
            }
            None => None,
        };

        candidates.push(EventCandidate {
            topic_id: topic_id.clone(),
            article_id: article.id.clone(),
            description: item.description,
            event_time,
            report_time: article.published_at,
            confidence: item.confidence,
            details: EventDetails {
                event_type: item.event_type,
                participants: item.participants,
                location: item.location,
            },
        });
    }

    (candidates, failures)
}

pub struct EventExtractor {
    scheduler: Arc<CallScheduler>,
}

impl EventExtractor {
    pub fn new(scheduler: Arc<CallScheduler>) -> Self {
        Self { scheduler }
    }

    pub async fn extract_events(&self, article: &Article, topic: &Topic) -> Extraction<EventCandidate> {
        let request = CapabilityRequest {
            article_id: article.id.clone(),
            article_text: article.capability_text(),
            published_at: article.published_at,
            topic_context: Some(topic.name.clone()),
            kind: TASK,
        };

        let call = self.scheduler.call(&request).await;
        let Some(response) = call.response.as_ref() else {
            warn!(
                target: TARGET_INGEST,
                "No event extraction for article {} / topic {}: {:?}", article.id, topic.id, call.outcome
            );
            return Extraction::empty(call);
        };

        let (candidates, failures) = events_from_response(&response.raw, article, &topic.id);
        info!(
            target: TARGET_INGEST,
            "Extracted {} events ({} soft failures) from article {} for topic '{}'",
            candidates.len(), failures.len(), article.id, topic.name
        );
        Extraction {
            candidates,
            failures,
            call,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventTime;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn article() -> Article {
        Article::new(
            "a-1",
            Utc.with_ymd_and_hms(2024, 2, 5, 9, 0, 0).unwrap(),
            "text",
            "https://example.com/a-1",
        )
    }

    #[test]
    fn test_missing_confidence_drops_only_that_item() {
        let raw = json!([
            {"description": "Council approved the budget", "event_time_text": "last month", "confidence": 0.9},
            {"description": "Mayor resigned", "event_time_text": "yesterday"},
            {"description": "Budget hearing held", "event_time_text": null, "confidence": 0.4}
        ]);
        let (candidates, failures) = events_from_response(&raw, &article(), &TopicId::from("t-1"));

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].event_time, EventTime::month(2024, 1));
        assert_eq!(candidates[0].report_time, article().published_at);
        assert_eq!(candidates[1].event_time, None);
        assert_eq!(candidates[0].details, EventDetails::default());

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].item, Some(1));
        assert_eq!(failures[0].reason, "missing confidence");
    }

    #[test]
    fn test_unparseable_time_keeps_candidate() {
        let raw = json!({"events": [
            {"description": "Bridge reopened", "event_time_text": "soon-ish", "confidence": 0.6}
        ]});
        let (candidates, failures) = events_from_response(&raw, &article(), &TopicId::from("t-1"));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].event_time, None);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].reason.contains("soon-ish"));
    }

    #[test]
    fn test_details_carried_to_candidate() {
        let raw = json!([{
            "description": "Council approved the budget",
            "event_time_text": "last month",
            "confidence": 0.9,
            "event_type": "vote",
            "participants": ["City Council", "Mayor Ana Lee"],
            "location": "City Hall"
        }]);
        let (candidates, failures) = events_from_response(&raw, &article(), &TopicId::from("t-1"));
        assert!(failures.is_empty());
        let details = &candidates[0].details;
        assert_eq!(details.event_type.as_deref(), Some("vote"));
        assert_eq!(details.participants, vec!["City Council", "Mayor Ana Lee"]);
        assert_eq!(details.location.as_deref(), Some("City Hall"));
    }

    #[test]
    fn test_malformed_response() {
        let (candidates, failures) =
            events_from_response(&json!({"answer": 42}), &article(), &TopicId::from("t-1"));
        assert!(candidates.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].item, None);
    }
}
