//! Deterministic test doubles.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::CapabilityError;
use crate::extract::capability::{
    CapabilityRequest, CapabilityResponse, ExtractionCapability, TaskKind,
};

type Script = VecDeque<Result<serde_json::Value, CapabilityError>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScriptKey {
    kind: TaskKind,
    article_id: String,
    topic: Option<String>,
}

/// Canned responses keyed by task kind, article and (optionally) topic
/// context. Each key holds a queue; the last entry repeats once the queue is
/// drained. Unscripted calls get an empty array.
#[derive(Default)]
pub(crate) struct ScriptedCapability {
    scripts: Mutex<HashMap<ScriptKey, Script>>,
    calls: Mutex<Vec<CapabilityRequest>>,
    delay: Option<Duration>,
}

impl ScriptedCapability {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long first, so tests can cancel mid-call.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(&self, key: ScriptKey, entry: Result<serde_json::Value, CapabilityError>) -> &Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(key).or_default().push_back(entry);
        }
        self
    }

    pub(crate) fn respond(&self, kind: TaskKind, article_id: &str, value: serde_json::Value) -> &Self {
        self.push(
            ScriptKey {
                kind,
                article_id: article_id.to_string(),
                topic: None,
            },
            Ok(value),
        )
    }

    pub(crate) fn respond_for_topic(
        &self,
        kind: TaskKind,
        article_id: &str,
        topic: &str,
        value: serde_json::Value,
    ) -> &Self {
        self.push(
            ScriptKey {
                kind,
                article_id: article_id.to_string(),
                topic: Some(topic.to_string()),
            },
            Ok(value),
        )
    }

    pub(crate) fn fail(&self, kind: TaskKind, article_id: &str, error: CapabilityError) -> &Self {
        self.push(
            ScriptKey {
                kind,
                article_id: article_id.to_string(),
                topic: None,
            },
            Err(error),
        )
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub(crate) fn calls_of(&self, kind: TaskKind) -> Vec<CapabilityRequest> {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|c| c.kind == kind).cloned().collect())
            .unwrap_or_default()
    }

    fn next(&self, request: &CapabilityRequest) -> Result<serde_json::Value, CapabilityError> {
        let Ok(mut scripts) = self.scripts.lock() else {
            return Err(CapabilityError::Hard("script lock poisoned".into()));
        };
        let specific = ScriptKey {
            kind: request.kind,
            article_id: request.article_id.clone(),
            topic: request.topic_context.clone(),
        };
        let general = ScriptKey {
            topic: None,
            ..specific.clone()
        };

        for key in [specific, general] {
            if let Some(queue) = scripts.get_mut(&key) {
                let entry = if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                };
                if let Some(entry) = entry {
                    return entry;
                }
            }
        }
        Ok(serde_json::Value::Array(Vec::new()))
    }
}

#[async_trait]
impl ExtractionCapability for ScriptedCapability {
    async fn extract(&self, request: &CapabilityRequest) -> Result<CapabilityResponse, CapabilityError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next(request).map(CapabilityResponse::from)
    }
}
