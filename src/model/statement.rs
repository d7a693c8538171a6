use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::topic::TopicId;
use crate::normalize::basic_normalize;

string_id!(StatementId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Supportive,
    Opposed,
    Neutral,
    Unclear,
}

impl Stance {
    pub const ALL: [Stance; 4] = [
        Stance::Supportive,
        Stance::Opposed,
        Stance::Neutral,
        Stance::Unclear,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stance::Supportive => "supportive",
            Stance::Opposed => "opposed",
            Stance::Neutral => "neutral",
            Stance::Unclear => "unclear",
        }
    }
}

/// Clamps free-form model output onto the four stances. Anything unrecognized
/// is `Unclear`.
impl From<&str> for Stance {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "supportive" | "support" | "supports" | "pro" | "for" => Stance::Supportive,
            "opposed" | "oppose" | "opposes" | "con" | "against" => Stance::Opposed,
            "neutral" | "balanced" => Stance::Neutral,
            _ => Stance::Unclear,
        }
    }
}

impl fmt::Display for Stance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who said it. `topic_id` links the speaker to a known topic; it is not part
/// of the statement's identity, since it changes as topics appear and merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Speaker {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub topic_id: Option<TopicId>,
}

impl Speaker {
    pub fn named(name: impl Into<String>) -> Self {
        Speaker {
            name: name.into(),
            topic_id: None,
        }
    }

    /// Identity used in the statement uniqueness key: the name as the
    /// article gave it, normalized.
    pub fn key(&self) -> String {
        basic_normalize(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementCandidate {
    pub topic_id: TopicId,
    pub article_id: String,
    pub speaker: Speaker,
    pub speaker_role: Option<String>,
    pub quote: String,
    pub stance: Stance,
    pub report_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub id: StatementId,
    pub topic_id: TopicId,
    pub speaker: Speaker,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub speaker_role: Option<String>,
    pub quote: String,
    pub stance: Stance,
    pub article_id: String,
    pub report_time: DateTime<Utc>,
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub merged_into: Option<StatementId>,
}
