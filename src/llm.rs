//! Language-model back ends for the extraction capability.

use async_openai::types::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs};
use async_openai::{config::OpenAIConfig, Client as OpenAIClient};
use async_trait::async_trait;
use lazy_static::lazy_static;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::options::GenerationOptions;
use ollama_rs::Ollama;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{LlmBackend, LlmSettings};
use crate::error::{CapabilityError, TransientExternalError};
use crate::extract::{CapabilityRequest, CapabilityResponse, ExtractionCapability};
use crate::prompts;
use crate::TARGET_LLM_REQUEST;

lazy_static! {
    static ref FENCED_BLOCK: Option<Regex> = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").ok();
}

#[derive(Clone, Debug)]
pub enum LLMClient {
    Ollama(Ollama),
    OpenAI(OpenAIClient<OpenAIConfig>),
}

impl LLMClient {
    pub fn from_settings(settings: &LlmSettings) -> Self {
        match &settings.backend {
            LlmBackend::Ollama { host, port } => {
                debug!(target: TARGET_LLM_REQUEST, "Connecting to Ollama at {}:{}", host, port);
                LLMClient::Ollama(Ollama::new(host.clone(), *port))
            }
            LlmBackend::OpenAI { api_key } => {
                let config = OpenAIConfig::new().with_api_key(api_key);
                LLMClient::OpenAI(OpenAIClient::with_config(config))
            }
        }
    }
}

#[derive(Clone)]
pub struct LLMParams {
    pub llm_client: LLMClient,
    pub model: String,
    pub temperature: f32,
}

/// Sorts a back-end error message into retryable and fatal failures.
fn classify(message: String) -> CapabilityError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("quota") {
        TransientExternalError::RateLimited(message).into()
    } else if ["connect", "timed out", "timeout", "502", "503", "504", "overloaded"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        TransientExternalError::Network(message).into()
    } else {
        CapabilityError::Hard(message)
    }
}

/// One generation request. Retries, pacing and the call timeout belong to
/// the caller's scheduler.
pub async fn generate_llm_response(prompt: &str, params: &LLMParams) -> Result<String, CapabilityError> {
    debug!(target: TARGET_LLM_REQUEST, "Sending prompt to {} ({} chars)", params.model, prompt.len());

    let text = match &params.llm_client {
        LLMClient::Ollama(ollama) => {
            let mut request = GenerationRequest::new(params.model.clone(), prompt.to_string());
            request.options = Some(GenerationOptions::default().temperature(params.temperature));
            ollama
                .generate(request)
                .await
                .map_err(|e| classify(e.to_string()))?
                .response
        }
        LLMClient::OpenAI(client) => {
            let message = ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|e| CapabilityError::Hard(e.to_string()))?;
            let request = CreateChatCompletionRequestArgs::default()
                .model(params.model.clone())
                .temperature(params.temperature)
                .messages([message.into()])
                .build()
                .map_err(|e| CapabilityError::Hard(e.to_string()))?;
            let response = client
                .chat()
                .create(request)
                .await
                .map_err(|e| classify(e.to_string()))?;
            response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .unwrap_or_default()
        }
    };

    debug!(target: TARGET_LLM_REQUEST, "Received {} chars from {}", text.len(), params.model);
    Ok(text)
}

fn parse_slice(text: &str, open: char, close: char) -> Option<Value> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Pulls the JSON payload out of model output: the whole text, a fenced
/// code block, or the outermost bracketed value.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(fenced) = FENCED_BLOCK
        .as_ref()
        .and_then(|re| re.captures(trimmed))
        .and_then(|caps| caps.get(1))
    {
        if let Ok(value) = serde_json::from_str(fenced.as_str().trim()) {
            return Some(value);
        }
    }

    // whichever bracket opens first is the outer value
    match (trimmed.find('['), trimmed.find('{')) {
        (Some(array), Some(object)) if object < array => {
            parse_slice(trimmed, '{', '}').or_else(|| parse_slice(trimmed, '[', ']'))
        }
        _ => parse_slice(trimmed, '[', ']').or_else(|| parse_slice(trimmed, '{', '}')),
    }
}

/// The extraction capability backed by a language model.
pub struct LlmCapability {
    params: LLMParams,
    max_topics: usize,
}

impl LlmCapability {
    pub fn new(params: LLMParams, max_topics: usize) -> Self {
        Self { params, max_topics }
    }
}

#[async_trait]
impl ExtractionCapability for LlmCapability {
    async fn extract(&self, request: &CapabilityRequest) -> Result<CapabilityResponse, CapabilityError> {
        let prompt = prompts::extraction_prompt(request, self.max_topics);
        let text = generate_llm_response(&prompt, &self.params).await?;

        match extract_json(&text) {
            Some(value) => Ok(value.into()),
            None => {
                warn!(
                    target: TARGET_LLM_REQUEST,
                    "No JSON in {} response for article {}: {}",
                    request.kind,
                    request.article_id,
                    text.chars().take(200).collect::<String>()
                );
                // validation downstream reports this as a soft failure
                Ok(Value::String(text).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_json_shapes() {
        assert_eq!(extract_json(r#" [{"a": 1}] "#), Some(json!([{"a": 1}])));
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"events\": []}\n```\nDone."),
            Some(json!({"events": []}))
        );
        assert_eq!(
            extract_json("The topics are [{\"name\": \"Harbor Bridge\", \"relevance\": 0.9}] as requested."),
            Some(json!([{"name": "Harbor Bridge", "relevance": 0.9}]))
        );
        assert_eq!(extract_json("Result: {\"statements\": []} ok"), Some(json!({"statements": []})));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify("HTTP 429 Too Many Requests".into()),
            CapabilityError::Transient(TransientExternalError::RateLimited(_))
        ));
        assert!(matches!(
            classify("error trying to connect: connection refused".into()),
            CapabilityError::Transient(TransientExternalError::Network(_))
        ));
        assert!(matches!(
            classify("invalid_api_key: Incorrect API key provided".into()),
            CapabilityError::Hard(_)
        ));
    }
}
