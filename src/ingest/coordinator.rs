use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::state::{ArticleMachine, IngestionState};
use crate::config::{IngestConfig, PipelineConfig};
use crate::db::{CallRecord, Database};
use crate::error::{IngestError, ReconciliationError, RegistryError, SoftExtractionFailure};
use crate::extract::{
    EventExtractor, ExtractionCapability, StatementExtractor, TaskKind, TopicDiscovery,
};
use crate::feed::SynthesisFeed;
use crate::locks::KeyedLocks;
use crate::model::{Article, EventCandidate, StatementCandidate, TopicId};
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::retry::{CallOutcome, CallReport, CallScheduler};
use crate::topic::{ResolveContext, TopicRegistry};
use crate::TARGET_INGEST;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestionOutcome {
    Ingested,
    IngestedWithWarnings,
    Failed,
}

/// Something that went wrong without failing the article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestionWarning {
    SoftExtraction {
        topic_id: Option<TopicId>,
        failure: SoftExtractionFailure,
    },
    /// The call gave up after retries or hit the daily budget.
    CallDowngraded {
        task: TaskKind,
        topic_id: Option<TopicId>,
        detail: String,
    },
    Reconciliation {
        error: ReconciliationError,
    },
    NoTopics,
}

/// Outcome of one ingestion attempt. Stored with the article so a repeated
/// submission of an ingested article returns it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionResult {
    pub article_id: String,
    pub attempt: i64,
    pub state: IngestionState,
    pub outcome: IngestionOutcome,
    pub topics: Vec<TopicId>,
    pub summary: ReconcileSummary,
    #[serde(default)]
    pub warnings: Vec<IngestionWarning>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl IngestionResult {
    fn started(article_id: &str, attempt: i64) -> Self {
        Self {
            article_id: article_id.to_string(),
            attempt,
            state: IngestionState::New,
            outcome: IngestionOutcome::Failed,
            topics: Vec::new(),
            summary: ReconcileSummary::default(),
            warnings: Vec::new(),
            error: None,
        }
    }

    /// Result for an attempt that could not be recorded at all.
    pub fn unrecorded(article_id: &str, error: &IngestError) -> Self {
        Self::started(article_id, 0).failed(error)
    }

    fn failed(mut self, error: &IngestError) -> Self {
        self.state = IngestionState::Failed;
        self.outcome = IngestionOutcome::Failed;
        self.error = Some(error.to_string());
        self
    }

    fn soft_failures(&mut self, topic_id: Option<&TopicId>, failures: Vec<SoftExtractionFailure>) {
        self.warnings.extend(failures.into_iter().map(|failure| IngestionWarning::SoftExtraction {
            topic_id: topic_id.cloned(),
            failure,
        }));
    }
}

/// Extracted candidates waiting for reconciliation.
struct TopicBatch {
    topic_id: TopicId,
    events: Vec<EventCandidate>,
    statements: Vec<StatementCandidate>,
}

/// Resolves only once cancellation is requested. A dropped sender means
/// cancellation can no longer happen.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if cancel.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drives articles through `New → TopicResolving → Extracting → Reconciling
/// → Ingested`.
///
/// Articles run concurrently; writes to one topic are serialized by the topic
/// lock, which is held only while that topic's candidates are reconciled.
pub struct IngestionCoordinator {
    db: Database,
    registry: TopicRegistry,
    reconciler: Reconciler,
    discovery: TopicDiscovery,
    events: EventExtractor,
    statements: StatementExtractor,
    locks: KeyedLocks,
    config: IngestConfig,
    cancel: watch::Receiver<bool>,
}

impl IngestionCoordinator {
    pub fn new(db: Database, capability: Arc<dyn ExtractionCapability>, config: &PipelineConfig) -> Self {
        let locks = KeyedLocks::new();
        let registry = TopicRegistry::new(db.clone(), &config.matching, locks.clone());
        let scheduler = Arc::new(CallScheduler::new(
            capability,
            &config.rate_limit,
            config.retry.clone(),
        ));
        let (_, cancel) = watch::channel(false);

        Self {
            reconciler: Reconciler::new(db.clone(), config.reconcile.clone()),
            discovery: TopicDiscovery::new(scheduler.clone(), &config.ingest),
            events: EventExtractor::new(scheduler.clone()),
            statements: StatementExtractor::new(scheduler, registry.clone()),
            db,
            registry,
            locks,
            config: config.ingest.clone(),
            cancel,
        }
    }

    /// Cancels in-flight and future ingestions once the flag turns `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn feed(&self) -> SynthesisFeed {
        SynthesisFeed::new(self.db.clone(), self.registry.clone(), self.locks.clone())
    }

    fn check_cancelled(&self) -> Result<(), IngestError> {
        if *self.cancel.borrow() {
            Err(IngestError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn cancellable<F: Future>(&self, work: F) -> Result<F::Output, IngestError> {
        self.check_cancelled()?;
        tokio::select! {
            output = work => Ok(output),
            _ = cancelled(self.cancel.clone()) => Err(IngestError::Cancelled),
        }
    }

    async fn transition(
        &self,
        article_id: &str,
        machine: &mut ArticleMachine,
        next: IngestionState,
    ) -> Result<(), IngestError> {
        self.check_cancelled()?;
        let from = machine.state();
        machine.advance(next)?;
        self.db.set_ingestion_state(article_id, next).await?;
        debug!(target: TARGET_INGEST, "Article {}: {} -> {}", article_id, from, next);
        Ok(())
    }

    /// Records the call and folds its outcome into the result. A hard failure
    /// fails the article.
    async fn settle_call(
        &self,
        result: &mut IngestionResult,
        task: TaskKind,
        topic_id: Option<&TopicId>,
        call: &CallReport,
    ) -> Result<(), IngestError> {
        self.db
            .record_call(&CallRecord {
                article_id: result.article_id.clone(),
                attempt: result.attempt,
                task,
                topic_id: topic_id.cloned(),
                outcome: call.outcome,
                retries: call.retries,
                detail: call.detail(),
            })
            .await?;

        match call.outcome {
            CallOutcome::Success => Ok(()),
            CallOutcome::SoftFailure => {
                result.warnings.push(IngestionWarning::CallDowngraded {
                    task,
                    topic_id: topic_id.cloned(),
                    detail: call.detail().unwrap_or_default(),
                });
                Ok(())
            }
            CallOutcome::HardFailure => Err(IngestError::Capability {
                task,
                message: call.detail().unwrap_or_default(),
            }),
        }
    }

    /// Ingests an article under the topics the capability discovers in it.
    ///
    /// Failures of the article itself are reported in the returned result
    /// (state `Failed`); `Err` means the attempt could not be recorded.
    pub async fn ingest(&self, article: &Article) -> Result<IngestionResult, IngestError> {
        self.run(article, None).await
    }

    /// Ingests an article under one known topic name, skipping discovery.
    pub async fn ingest_for_topic(
        &self,
        article: &Article,
        topic_name: &str,
    ) -> Result<IngestionResult, IngestError> {
        self.run(article, Some(topic_name)).await
    }

    #[instrument(target = "ingest", skip(self, article), fields(article_id = %article.id))]
    async fn run(&self, article: &Article, topic_name: Option<&str>) -> Result<IngestionResult, IngestError> {
        // held from the ingested check until the result is stored
        let _article_guard = self.locks.lock_article(&article.id).await;
        if let Some(record) = self.db.get_ingestion(&article.id).await? {
            if record.state == IngestionState::Ingested {
                if let Some(stored) = record.result.as_deref() {
                    info!(target: TARGET_INGEST, "Article {} already ingested; returning stored result", article.id);
                    return Ok(serde_json::from_str(stored)?);
                }
            }
        }

        self.db.store_article(article).await?;
        let attempt = self.db.begin_ingestion(&article.id).await?;
        info!(target: TARGET_INGEST, "Ingesting article {} (attempt {})", article.id, attempt);

        let mut machine = ArticleMachine::default();
        let mut result = IngestionResult::started(&article.id, attempt);

        let result = match self.process(article, topic_name, &mut machine, &mut result).await {
            Ok(()) => {
                result.state = machine.state();
                result.outcome = if result.warnings.is_empty() {
                    IngestionOutcome::Ingested
                } else {
                    IngestionOutcome::IngestedWithWarnings
                };
                info!(
                    target: TARGET_INGEST,
                    "Article {} ingested: {} events created, {} merged, {} statements, {} warnings",
                    article.id,
                    result.summary.events_created,
                    result.summary.events_merged,
                    result.summary.statements_created,
                    result.warnings.len()
                );
                result
            }
            Err(e) => {
                error!(target: TARGET_INGEST, "Article {} failed in state {}: {}", article.id, machine.state(), e);
                if let Err(invalid) = machine.advance(IngestionState::Failed) {
                    warn!(target: TARGET_INGEST, "{}", invalid);
                }
                result.failed(&e)
            }
        };

        let stored = serde_json::to_string(&result)?;
        self.db
            .finish_ingestion(&article.id, result.state, &stored, result.error.as_deref())
            .await?;
        Ok(result)
    }

    async fn process(
        &self,
        article: &Article,
        topic_name: Option<&str>,
        machine: &mut ArticleMachine,
        result: &mut IngestionResult,
    ) -> Result<(), IngestError> {
        self.transition(&article.id, machine, IngestionState::TopicResolving).await?;
        let names = match topic_name {
            Some(name) => vec![name.to_string()],
            None => {
                let discovery = self.cancellable(self.discovery.discover_topics(article)).await?;
                self.settle_call(result, TaskKind::TopicExtraction, None, &discovery.call)
                    .await?;
                result.soft_failures(None, discovery.failures);
                discovery.candidates.into_iter().map(|t| t.name).collect()
            }
        };

        let context = ResolveContext::for_article(&article.id);
        for name in names {
            self.check_cancelled()?;
            let topic_id = self.registry.resolve_or_create(&name, &context).await?;
            if !result.topics.contains(&topic_id) {
                result.topics.push(topic_id);
            }
        }
        if result.topics.is_empty() {
            warn!(target: TARGET_INGEST, "No topics found for article {}", article.id);
            result.warnings.push(IngestionWarning::NoTopics);
        }

        self.transition(&article.id, machine, IngestionState::Extracting).await?;
        let mut batches = Vec::with_capacity(result.topics.len());
        for topic_id in result.topics.clone() {
            let topic = self
                .registry
                .get_topic(&topic_id)
                .await?
                .ok_or_else(|| RegistryError::UnknownTopic(topic_id.clone()))?;

            let (events, statements) = self
                .cancellable(async {
                    tokio::join!(
                        self.events.extract_events(article, &topic),
                        self.statements.extract_statements(article, &topic)
                    )
                })
                .await?;

            self.settle_call(result, TaskKind::EventExtraction, Some(&topic_id), &events.call)
                .await?;
            let statements = statements?;
            self.settle_call(result, TaskKind::StatementExtraction, Some(&topic_id), &statements.call)
                .await?;
            result.soft_failures(Some(&topic_id), events.failures);
            result.soft_failures(Some(&topic_id), statements.failures);

            batches.push(TopicBatch {
                topic_id,
                events: events.candidates,
                statements: statements.candidates,
            });
        }

        self.transition(&article.id, machine, IngestionState::Reconciling).await?;
        let mut integrity = None;
        for batch in batches {
            self.check_cancelled()?;
            match self.reconcile_batch(batch).await {
                Ok(mut summary) => {
                    result.warnings.extend(
                        summary
                            .errors
                            .drain(..)
                            .map(|error| IngestionWarning::Reconciliation { error }),
                    );
                    result.summary.absorb(summary);
                }
                // other topics still reconcile; the article fails afterwards
                Err(IngestError::Integrity(e)) => {
                    error!(target: TARGET_INGEST, "Article {}: {}", article.id, e);
                    integrity.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = integrity {
            return Err(e.into());
        }

        self.transition(&article.id, machine, IngestionState::Ingested).await
    }

    /// Reconciles one topic's candidates under that topic's lock. The topic
    /// is re-resolved after locking, since a merge may have redirected it.
    async fn reconcile_batch(&self, batch: TopicBatch) -> Result<ReconcileSummary, IngestError> {
        let (canonical, _guard) = loop {
            let canonical = self.registry.canonical(&batch.topic_id).await?;
            let guard = self.locks.lock_topic(&canonical).await;
            if self.registry.canonical(&canonical).await? == canonical {
                break (canonical, guard);
            }
        };

        let TopicBatch {
            topic_id,
            mut events,
            mut statements,
        } = batch;
        if canonical != topic_id {
            debug!(target: TARGET_INGEST, "Topic {} now redirects to {}", topic_id, canonical);
            events.iter_mut().for_each(|c| c.topic_id = canonical.clone());
            statements.iter_mut().for_each(|c| c.topic_id = canonical.clone());
        }

        let mut summary = self.reconciler.reconcile_events(&canonical, events).await?;
        summary.absorb(self.reconciler.reconcile_statements(&canonical, statements).await?);
        Ok(summary)
    }

    /// Ingests articles concurrently, at most `batch_concurrency` at a time.
    /// Results come back in input order.
    pub async fn ingest_batch(&self, articles: &[Article]) -> Vec<IngestionResult> {
        let results: Vec<IngestionResult> = stream::iter(articles)
            .map(|article| async move {
                match self.ingest(article).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(target: TARGET_INGEST, "Could not record ingestion of {}: {}", article.id, e);
                        IngestionResult::unrecorded(&article.id, &e)
                    }
                }
            })
            .buffered(self.config.batch_concurrency.max(1))
            .collect()
            .await;

        let failed = results
            .iter()
            .filter(|r| r.outcome == IngestionOutcome::Failed)
            .count();
        info!(
            target: TARGET_INGEST,
            "Batch of {} articles finished: {} failed", results.len(), failed
        );
        results
    }

    /// Merges two topics and folds the duplicate events the merge brings
    /// together. Returns the surviving topic.
    pub async fn merge_topics(
        &self,
        topic_a: &TopicId,
        topic_b: &TopicId,
    ) -> Result<(TopicId, ReconcileSummary), IngestError> {
        let survivor = self.registry.merge(topic_a, topic_b).await?;
        let _guard = self.locks.lock_topic(&survivor).await;
        let summary = self.reconciler.consolidate_topic(&survivor).await?;
        Ok((survivor, summary))
    }
}
