use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CapabilityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    EventExtraction,
    StatementExtraction,
    TopicExtraction,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::EventExtraction => "event-extraction",
            TaskKind::StatementExtraction => "statement-extraction",
            TaskKind::TopicExtraction => "topic-extraction",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event-extraction" => Ok(TaskKind::EventExtraction),
            "statement-extraction" => Ok(TaskKind::StatementExtraction),
            "topic-extraction" => Ok(TaskKind::TopicExtraction),
            other => Err(format!("unknown task kind '{}'", other)),
        }
    }
}

/// Input to one extraction call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityRequest {
    pub article_id: String,
    pub article_text: String,
    pub published_at: DateTime<Utc>,
    /// Name of the topic the extraction is about. Absent for topic discovery.
    pub topic_context: Option<String>,
    pub kind: TaskKind,
}

/// Raw structured output of a call, validated by the extractors.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityResponse {
    pub raw: serde_json::Value,
}

impl From<serde_json::Value> for CapabilityResponse {
    fn from(raw: serde_json::Value) -> Self {
        Self { raw }
    }
}

/// The language-understanding service behind event, statement and topic
/// extraction.
#[async_trait]
pub trait ExtractionCapability: Send + Sync {
    async fn extract(&self, request: &CapabilityRequest)
        -> Result<CapabilityResponse, CapabilityError>;
}
