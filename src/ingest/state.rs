use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// Per-article ingestion lifecycle.
///
/// `New → TopicResolving → Extracting → Reconciling → Ingested`; any
/// non-terminal state may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionState {
    New,
    TopicResolving,
    Extracting,
    Reconciling,
    Ingested,
    Failed,
}

impl IngestionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionState::New => "new",
            IngestionState::TopicResolving => "topic_resolving",
            IngestionState::Extracting => "extracting",
            IngestionState::Reconciling => "reconciling",
            IngestionState::Ingested => "ingested",
            IngestionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionState::Ingested | IngestionState::Failed)
    }

    pub fn can_transition_to(&self, next: IngestionState) -> bool {
        use IngestionState::*;
        match (self, next) {
            (New, TopicResolving)
            | (TopicResolving, Extracting)
            | (Extracting, Reconciling)
            | (Reconciling, Ingested) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for IngestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(IngestionState::New),
            "topic_resolving" => Ok(IngestionState::TopicResolving),
            "extracting" => Ok(IngestionState::Extracting),
            "reconciling" => Ok(IngestionState::Reconciling),
            "ingested" => Ok(IngestionState::Ingested),
            "failed" => Ok(IngestionState::Failed),
            other => Err(format!("unknown ingestion state '{}'", other)),
        }
    }
}

/// Tracks one attempt's position in the lifecycle and rejects illegal moves.
#[derive(Debug)]
pub struct ArticleMachine {
    state: IngestionState,
}

impl Default for ArticleMachine {
    fn default() -> Self {
        Self {
            state: IngestionState::New,
        }
    }
}

impl ArticleMachine {
    pub fn state(&self) -> IngestionState {
        self.state
    }

    pub fn advance(&mut self, next: IngestionState) -> Result<IngestionState, IngestError> {
        if !self.state.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(next)
    }
}
