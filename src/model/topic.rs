use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

string_id!(
    /// Stable identifier of a canonical topic. Merged-away ids stay valid as
    /// redirects.
    TopicId
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    /// Primary display name.
    pub name: String,
    /// Every name this topic has been seen under, in the order first seen.
    pub aliases: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub redirect_to: Option<TopicId>,
}

impl Topic {
    pub fn is_redirect(&self) -> bool {
        self.redirect_to.is_some()
    }

    /// Ordering used to pick the survivor of a merge: earlier creation wins,
    /// then the lexically smaller id.
    pub fn precedes(&self, other: &Topic) -> bool {
        (self.created_at, &self.id) < (other.created_at, &other.id)
    }
}
