use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::time::EventTime;
use super::topic::TopicId;
use crate::normalize::basic_normalize;

string_id!(EventId);

/// One article supporting an event, with the moment that article reported it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub article_id: String,
    pub report_time: DateTime<Utc>,
}

/// Descriptive attributes of an event that play no part in matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDetails {
    /// Category such as "vote", "arrest" or "policy change".
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub event_type: Option<String>,
    /// People and organizations involved, in first-seen order.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub participants: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub location: Option<String>,
}

impl EventDetails {
    /// Adds participants not already listed under another spelling and fills
    /// a missing type or location. Values already present are kept.
    pub fn absorb(&mut self, other: &EventDetails) {
        for participant in &other.participants {
            let key = basic_normalize(participant);
            if key.is_empty() {
                continue;
            }
            if !self.participants.iter().any(|p| basic_normalize(p) == key) {
                self.participants.push(participant.clone());
            }
        }
        if self.event_type.is_none() {
            self.event_type = other.event_type.clone();
        }
        if self.location.is_none() {
            self.location = other.location.clone();
        }
    }
}

/// An event as extracted from a single article, before reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCandidate {
    pub topic_id: TopicId,
    pub article_id: String,
    pub description: String,
    pub event_time: Option<EventTime>,
    pub report_time: DateTime<Utc>,
    pub confidence: f64,
    #[serde(flatten)]
    pub details: EventDetails,
}

/// A canonical, reconciled event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub topic_id: TopicId,
    pub description: String,
    pub event_time: Option<EventTime>,
    /// Publication time of the earliest article that reported the event.
    pub report_time: DateTime<Utc>,
    pub confidence: f64,
    #[serde(flatten)]
    pub details: EventDetails,
    /// Supporting articles, ordered by report time.
    pub provenance: Vec<Provenance>,
    pub created_at: DateTime<Utc>,
    /// Insertion order; used as the stable tie-break when ordering timelines.
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub merged_into: Option<EventId>,
}

impl Event {
    pub fn is_active(&self) -> bool {
        self.merged_into.is_none()
    }

    pub fn article_ids(&self) -> Vec<&str> {
        self.provenance.iter().map(|p| p.article_id.as_str()).collect()
    }

    pub fn supported_by(&self, article_id: &str) -> bool {
        self.provenance.iter().any(|p| p.article_id == article_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_details_absorb_unions_participants() {
        let mut details = EventDetails {
            event_type: Some("vote".into()),
            participants: vec!["City Council".into(), "Mayor Ana Lee".into()],
            location: None,
        };
        details.absorb(&EventDetails {
            event_type: Some("meeting".into()),
            participants: vec!["mayor ana lee".into(), "Budget Office".into(), " ".into()],
            location: Some("City Hall".into()),
        });

        assert_eq!(details.event_type.as_deref(), Some("vote"));
        assert_eq!(details.location.as_deref(), Some("City Hall"));
        assert_eq!(details.participants, vec!["City Council", "Mayor Ana Lee", "Budget Office"]);
    }
}
