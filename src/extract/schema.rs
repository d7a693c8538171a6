//! Item shapes expected from the extraction capability, and the per-item
//! validation applied at the boundary.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::capability::TaskKind;
use crate::error::SoftExtractionFailure;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventItem {
    /// What happened, in one sentence.
    pub description: String,
    /// When it happened, as written or implied in the article; null if unknown.
    pub event_time_text: Option<String>,
    /// Confidence between 0 and 1 that the article reports this event.
    pub confidence: f64,
    /// Category such as vote, arrest, policy change, meeting or protest.
    #[serde(default)]
    pub event_type: Option<String>,
    /// People and organizations involved.
    #[serde(default)]
    pub participants: Vec<String>,
    /// Where it happened, if the article says.
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StatementItem {
    /// Person or organization quoted.
    pub speaker: String,
    /// The quote, verbatim.
    pub quote: String,
    /// One of supportive, opposed, neutral, unclear.
    pub stance: Option<String>,
    /// The speaker's role or title, if given.
    pub speaker_role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TopicItem {
    /// Short canonical name of the topic.
    pub name: String,
    /// How central the topic is to the article, between 0 and 1.
    pub relevance: f64,
}

/// Wrapper key accepted around the item array.
fn wrapper_key(task: TaskKind) -> &'static str {
    match task {
        TaskKind::EventExtraction => "events",
        TaskKind::StatementExtraction => "statements",
        TaskKind::TopicExtraction => "topics",
    }
}

/// The item array of a response: either the response itself or the array
/// under the task's wrapper key.
pub fn response_items(raw: &Value, task: TaskKind) -> Result<&Vec<Value>, SoftExtractionFailure> {
    match raw {
        Value::Array(items) => Ok(items),
        Value::Object(map) => match map.get(wrapper_key(task)) {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(SoftExtractionFailure::response(
                task,
                format!("'{}' is not an array", wrapper_key(task)),
            )),
            None => Err(SoftExtractionFailure::response(
                task,
                format!("expected an array or an object with '{}'", wrapper_key(task)),
            )),
        },
        other => Err(SoftExtractionFailure::response(
            task,
            format!("expected an array, got {}", json_type(other)),
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_text(item: &Value, field: &str) -> Result<String, String> {
    match item.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(format!("empty {}", field)),
        None | Some(Value::Null) => Err(format!("missing {}", field)),
        Some(other) => Err(format!("{} is a {}, not a string", field, json_type(other))),
    }
}

fn optional_text(item: &Value, field: &str) -> Result<Option<String>, String> {
    match item.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(format!("{} is a {}, not a string", field, json_type(other))),
    }
}

/// Non-empty strings of an array field; other entries are skipped.
fn string_list(item: &Value, field: &str) -> Result<Vec<String>, String> {
    match item.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(values)) => Ok(values
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        Some(other) => Err(format!("{} is a {}, not an array", field, json_type(other))),
    }
}

fn unit_interval(item: &Value, field: &str, default: Option<f64>) -> Result<f64, String> {
    let value = match (item.get(field), default) {
        (None | Some(Value::Null), Some(default)) => return Ok(default),
        (None | Some(Value::Null), None) => return Err(format!("missing {}", field)),
        (Some(Value::Number(n)), _) => n
            .as_f64()
            .ok_or_else(|| format!("{} is not a finite number", field))?,
        (Some(other), _) => {
            return Err(format!("{} is a {}, not a number", field, json_type(other)))
        }
    };
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{} {} outside [0, 1]", field, value))
    }
}

fn object(item: &Value) -> Result<&Value, String> {
    if item.is_object() {
        Ok(item)
    } else {
        Err(format!("item is a {}, not an object", json_type(item)))
    }
}

pub fn parse_event_item(item: &Value) -> Result<EventItem, String> {
    let item = object(item)?;
    Ok(EventItem {
        description: required_text(item, "description")?,
        event_time_text: optional_text(item, "event_time_text")?,
        confidence: unit_interval(item, "confidence", None)?,
        // descriptive only; malformed values are dropped rather than failing the item
        event_type: optional_text(item, "event_type").unwrap_or(None),
        participants: string_list(item, "participants").unwrap_or_default(),
        location: optional_text(item, "location").unwrap_or(None),
    })
}

pub fn parse_statement_item(item: &Value) -> Result<StatementItem, String> {
    let item = object(item)?;
    Ok(StatementItem {
        speaker: required_text(item, "speaker")?,
        quote: required_text(item, "quote")?,
        stance: optional_text(item, "stance")?,
        // auxiliary; a malformed role is dropped rather than failing the item
        speaker_role: optional_text(item, "speaker_role").unwrap_or(None),
    })
}

pub fn parse_topic_item(item: &Value) -> Result<TopicItem, String> {
    let item = object(item)?;
    Ok(TopicItem {
        name: required_text(item, "name")?,
        relevance: unit_interval(item, "relevance", Some(1.0))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_shapes() {
        let bare = json!([{"description": "x"}]);
        assert_eq!(response_items(&bare, TaskKind::EventExtraction).unwrap().len(), 1);

        let wrapped = json!({"statements": []});
        assert!(response_items(&wrapped, TaskKind::StatementExtraction).is_ok());

        let wrong_key = json!({"events": []});
        let err = response_items(&wrong_key, TaskKind::TopicExtraction).unwrap_err();
        assert_eq!(err.item, None);

        assert!(response_items(&json!("nope"), TaskKind::EventExtraction).is_err());
    }

    #[test]
    fn test_event_item_validation() {
        let ok = parse_event_item(&json!({
            "description": " Council approved the budget ",
            "event_time_text": null,
            "confidence": 0.8
        }))
        .unwrap();
        assert_eq!(ok.description, "Council approved the budget");
        assert_eq!(ok.event_time_text, None);
        assert_eq!(ok.event_type, None);
        assert!(ok.participants.is_empty());

        let detailed = parse_event_item(&json!({
            "description": "Council approved the budget",
            "confidence": 0.8,
            "event_type": " vote ",
            "participants": ["City Council", "", 3, "Mayor Lee"],
            "location": "City Hall"
        }))
        .unwrap();
        assert_eq!(detailed.event_type.as_deref(), Some("vote"));
        assert_eq!(detailed.participants, vec!["City Council", "Mayor Lee"]);
        assert_eq!(detailed.location.as_deref(), Some("City Hall"));

        // malformed details do not cost the event
        let sloppy = parse_event_item(&json!({
            "description": "Council approved the budget",
            "confidence": 0.8,
            "participants": "City Council",
            "location": 12
        }))
        .unwrap();
        assert!(sloppy.participants.is_empty());
        assert_eq!(sloppy.location, None);

        assert_eq!(
            parse_event_item(&json!({"description": "x", "event_time_text": "Jan 2024"})),
            Err("missing confidence".to_string())
        );
        assert_eq!(
            parse_event_item(&json!({"description": "x", "confidence": "high"})),
            Err("confidence is a string, not a number".to_string())
        );
        assert_eq!(
            parse_event_item(&json!({"description": "x", "confidence": 1.5})),
            Err("confidence 1.5 outside [0, 1]".to_string())
        );
        assert_eq!(
            parse_event_item(&json!({"description": "", "confidence": 0.5})),
            Err("empty description".to_string())
        );
        assert!(parse_event_item(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_statement_and_topic_items() {
        let statement = parse_statement_item(&json!({
            "speaker": "Mayor Lee",
            "quote": "We kept our promise.",
            "speaker_role": 7
        }))
        .unwrap();
        assert_eq!(statement.stance, None);
        assert_eq!(statement.speaker_role, None);
        assert!(parse_statement_item(&json!({"speaker": "Lee"})).is_err());

        let topic = parse_topic_item(&json!({"name": "City Budget"})).unwrap();
        assert_eq!(topic.relevance, 1.0);
        assert!(parse_topic_item(&json!({"name": "x", "relevance": -0.1})).is_err());
    }
}
