//! Error taxonomy.
//!
//! Only [`IngestError`] fails an article. Transient external errors are retried
//! and then downgraded, soft extraction failures and reconciliation errors are
//! recorded as warnings, and a [`DataIntegrityError`] stops writes to a single
//! topic.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::extract::capability::TaskKind;
use crate::ingest::state::IngestionState;
use crate::model::TopicId;

/// Rate limits, network trouble and timeouts from an external capability.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransientExternalError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("daily request budget of {0} exhausted")]
    BudgetExhausted(u32),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error(transparent)]
    Transient(#[from] TransientExternalError),
    /// Not worth retrying: bad credentials, unknown model, rejected request.
    #[error("external capability failed: {0}")]
    Hard(String),
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient(_))
    }
}

/// A malformed or partial capability response, confined to one item (or to
/// one whole response when its shape is wrong).
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("soft {task} failure{}: {reason}", item_label(.item))]
pub struct SoftExtractionFailure {
    pub task: TaskKind,
    /// Index of the offending entry, `None` when the whole response was unusable.
    pub item: Option<usize>,
    pub reason: String,
}

fn item_label(item: &Option<usize>) -> String {
    item.map(|i| format!(" at item {}", i)).unwrap_or_default()
}

impl SoftExtractionFailure {
    pub fn item(task: TaskKind, item: usize, reason: impl Into<String>) -> Self {
        Self {
            task,
            item: Some(item),
            reason: reason.into(),
        }
    }

    pub fn response(task: TaskKind, reason: impl Into<String>) -> Self {
        Self {
            task,
            item: None,
            reason: reason.into(),
        }
    }
}

/// Two topic ids already redirect to different surviving topics.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("topics {topic_a} and {topic_b} already redirect to different topics ({survivor_a} vs {survivor_b})")]
pub struct ConflictError {
    pub topic_a: TopicId,
    pub topic_b: TopicId,
    pub survivor_a: TopicId,
    pub survivor_b: TopicId,
}

/// One candidate could not be merged into the canonical store. Recorded against
/// the article; the article's other candidates still proceed.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("could not reconcile '{candidate}' into topic {topic_id}: {reason}")]
pub struct ReconciliationError {
    pub topic_id: TopicId,
    pub candidate: String,
    pub reason: String,
}

/// The canonical store is inconsistent for a topic. Writes to that topic stop
/// until an operator clears its quarantine.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("data integrity violation for topic {topic_id}: {detail}")]
pub struct DataIntegrityError {
    pub topic_id: TopicId,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("topic name '{0}' is empty after normalization")]
    EmptyName(String),
    #[error("unknown topic {0}")]
    UnknownTopic(TopicId),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Integrity(#[from] DataIntegrityError),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Integrity(#[from] DataIntegrityError),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Errors that move an article to `Failed`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Integrity(#[from] DataIntegrityError),
    #[error("{task} call failed: {message}")]
    Capability { task: TaskKind, message: String },
    #[error("ingestion cancelled")]
    Cancelled,
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: IngestionState,
        to: IngestionState,
    },
    #[error("could not decode stored result: {0}")]
    StoredResult(#[from] serde_json::Error),
}

impl From<ReconcileError> for IngestError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Integrity(e) => IngestError::Integrity(e),
            ReconcileError::Store(e) => IngestError::Store(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}
