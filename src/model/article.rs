use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A news article as delivered by the archive. Immutable once stored; the
/// source id is the idempotence key for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    /// Report-time anchor for everything extracted from this article.
    pub published_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub headline: Option<String>,
    pub text: String,
    pub url: String,
}

impl Article {
    pub fn new(
        id: impl Into<String>,
        published_at: DateTime<Utc>,
        text: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Article {
            id: id.into(),
            published_at,
            headline: None,
            text: text.into(),
            url: url.into(),
        }
    }

    pub fn with_headline(mut self, headline: impl Into<String>) -> Self {
        self.headline = Some(headline.into());
        self
    }

    /// Text handed to the extraction capability.
    pub fn capability_text(&self) -> String {
        match self.headline.as_deref().map(str::trim) {
            Some(headline) if !headline.is_empty() => {
                format!("Headline: {}\n\n{}", headline, self.text.trim())
            }
            _ => self.text.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_capability_text_includes_headline() {
        let published = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let article = Article::new("a-1", published, "  The council met.  ", "https://example.com/a-1");
        assert_eq!(article.capability_text(), "The council met.");

        let article = article.with_headline("Budget passes");
        assert_eq!(
            article.capability_text(),
            "Headline: Budget passes\n\nThe council met."
        );
    }
}
