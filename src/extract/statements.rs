use std::sync::Arc;
use tracing::{debug, info, warn};

use super::capability::{CapabilityRequest, TaskKind};
use super::schema::{parse_statement_item, response_items, StatementItem};
use super::Extraction;
use crate::error::{RegistryError, SoftExtractionFailure};
use crate::model::{Article, Speaker, Stance, StatementCandidate, Topic};
use crate::retry::CallScheduler;
use crate::topic::TopicRegistry;
use crate::TARGET_INGEST;

const TASK: TaskKind = TaskKind::StatementExtraction;

pub struct StatementExtractor {
    scheduler: Arc<CallScheduler>,
    registry: TopicRegistry,
}

impl StatementExtractor {
    pub fn new(scheduler: Arc<CallScheduler>, registry: TopicRegistry) -> Self {
        Self {
            scheduler,
            registry,
        }
    }

    /// Known speakers are linked to their topic; lookup never creates topics.
    async fn speaker(&self, name: &str) -> Result<Speaker, RegistryError> {
        Ok(Speaker {
            name: name.to_string(),
            topic_id: self.registry.lookup(name).await?,
        })
    }

    /// Fails only when a speaker cannot be looked up in the store.
    pub async fn extract_statements(
        &self,
        article: &Article,
        topic: &Topic,
    ) -> Result<Extraction<StatementCandidate>, RegistryError> {
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
                "No statement extraction for article {} / topic {}: {:?}", article.id, topic.id, call.outcome
            );
            return Ok(Extraction::empty(call));
        };

        let (items, failures) = statement_items(&response.raw);
        let mut candidates = Vec::with_capacity(items.len());
        for item in items {
            candidates.push(StatementCandidate {
                topic_id: topic.id.clone(),
                article_id: article.id.clone(),
                speaker: self.speaker(&item.speaker).await?,
                speaker_role: item.speaker_role,
                quote: item.quote,
                stance: item.stance.as_deref().map(Stance::from).unwrap_or(Stance::Unclear),
                report_time: article.published_at,
            });
        }

        info!(
            target: TARGET_INGEST,
            "Extracted {} statements ({} soft failures) from article {} for topic '{}'",
            candidates.len(), failures.len(), article.id, topic.name
        );
        Ok(Extraction {
            candidates,
            failures,
            call,
        })
    }
}

fn statement_items(raw: &serde_json::Value) -> (Vec<StatementItem>, Vec<SoftExtractionFailure>) {
    let values = match response_items(raw, TASK) {
        Ok(values) => values,
        Err(failure) => return (Vec::new(), vec![failure]),
    };

    let mut items = Vec::with_capacity(values.len());
    let mut failures = Vec::new();
    for (index, value) in values.iter().enumerate() {
        match parse_statement_item(value) {
            Ok(item) => items.push(item),
            Err(reason) => {
                debug!(target: TARGET_INGEST, "Dropping statement item {}: {}", index, reason);
                failures.push(SoftExtractionFailure::item(TASK, index, reason));
            }
        }
    }
    (items, failures)
}
