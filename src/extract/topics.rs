use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::capability::{CapabilityRequest, TaskKind};
use super::schema::{parse_topic_item, response_items};
use super::Extraction;
use crate::config::IngestConfig;
use crate::error::SoftExtractionFailure;
use crate::model::Article;
use crate::normalize::basic_normalize;
use crate::retry::CallScheduler;
use crate::TARGET_INGEST;

const TASK: TaskKind = TaskKind::TopicExtraction;

/// A topic name proposed for an article, before registry resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredTopic {
    pub name: String,
    pub relevance: f64,
}

pub fn topics_from_response(
    raw: &serde_json::Value,
) -> (Vec<DiscoveredTopic>, Vec<SoftExtractionFailure>) {
    let items = match response_items(raw, TASK) {
        Ok(items) => items,
        Err(failure) => return (Vec::new(), vec![failure]),
    };

    let mut topics = Vec::with_capacity(items.len());
    let mut failures = Vec::new();
    for (index, value) in items.iter().enumerate() {
        match parse_topic_item(value) {
            Ok(item) => topics.push(DiscoveredTopic {
                name: item.name,
                relevance: item.relevance,
            }),
            Err(reason) => {
                debug!(target: TARGET_INGEST, "Dropping topic item {}: {}", index, reason);
                failures.push(SoftExtractionFailure::item(TASK, index, reason));
            }
        }
    }
    (topics, failures)
}

/// Keeps topics at or above `min_relevance`, most relevant first, one per
/// normalized name, at most `max_topics`.
fn select_topics(mut topics: Vec<DiscoveredTopic>, min_relevance: f64, max_topics: usize) -> Vec<DiscoveredTopic> {
    topics.retain(|t| t.relevance >= min_relevance);
    topics.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

    let mut seen = HashSet::new();
    topics.retain(|t| seen.insert(basic_normalize(&t.name)));
    topics.truncate(max_topics);
    topics
}

pub struct TopicDiscovery {
    scheduler: Arc<CallScheduler>,
    min_relevance: f64,
    max_topics: usize,
}

impl TopicDiscovery {
    pub fn new(scheduler: Arc<CallScheduler>, config: &IngestConfig) -> Self {
        Self {
            scheduler,
            min_relevance: config.min_topic_relevance,
            max_topics: config.max_topics_per_article,
        }
    }

    pub async fn discover_topics(&self, article: &Article) -> Extraction<DiscoveredTopic> {
        let request = CapabilityRequest {
            article_id: article.id.clone(),
            article_text: article.capability_text(),
            published_at: article.published_at,
            topic_context: None,
            kind: TASK,
        };

        let call = self.scheduler.call(&request).await;
        let Some(response) = call.response.as_ref() else {
            warn!(target: TARGET_INGEST, "No topic discovery for article {}: {:?}", article.id, call.outcome);
            return Extraction::empty(call);
        };

        let (topics, failures) = topics_from_response(&response.raw);
        let proposed = topics.len();
        let candidates = select_topics(topics, self.min_relevance, self.max_topics);
        info!(
            target: TARGET_INGEST,
            "Discovered {} topics for article {} ({} proposed, {} soft failures)",
            candidates.len(), article.id, proposed, failures.len()
        );
        Extraction {
            candidates,
            failures,
            call,
        }
    }
}
