// prompts.rs

use schemars::{schema_for, JsonSchema};

use crate::extract::schema::{EventItem, StatementItem, TopicItem};
use crate::extract::{CapabilityRequest, TaskKind};

const JSON_ONLY: &str = r#"
Respond with JSON only. Do not add commentary before or after it, do not wrap it in
Markdown, and do not explain what you are doing. If nothing qualifies, return [].
"#;

fn item_schema<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default()
}

pub fn event_extraction_prompt(article_text: &str, published: &str, topic_name: &str) -> String {
    format!(
        r#"
ARTICLE (published {published}):
----------
{article}
----------

TASK: List the events this article reports about "{topic}".

GUIDELINES:
- One entry per distinct real-world occurrence; do not split one event into several.
- "description" is a single neutral sentence saying what happened.
- "event_time_text" is when it happened, as written or implied in the article
  ("March 2024", "last Tuesday", "2023-Q4", "yesterday"). Use null when the article
  gives no usable time. Do not convert relative expressions yourself.
- "confidence" is a number between 0 and 1: how clearly the article states that
  this event took place.
- "event_type" is a short category such as vote, arrest, policy change, meeting,
  protest or legal action; null if none fits.
- "participants" lists the people and organizations involved, by full name.
- "location" is where it happened if the article says, else null.
- Ignore events unrelated to "{topic}".

Return a JSON array of objects matching this schema:
{schema}
{json_only}"#,
        published = published,
        article = article_text,
        topic = topic_name,
        schema = item_schema::<EventItem>(),
        json_only = JSON_ONLY,
    )
}

pub fn statement_extraction_prompt(article_text: &str, topic_name: &str) -> String {
    format!(
        r#"
ARTICLE:
----------
{article}
----------

TASK: List the attributed statements in this article about "{topic}".

GUIDELINES:
- Only direct quotes or clearly attributed paraphrases.
- "speaker" is the full name of the person or organization, as given in the article.
- "quote" is the statement verbatim, without surrounding quotation marks.
- "stance" is the speaker's position toward "{topic}": supportive, opposed,
  neutral or unclear.
- "speaker_role" is the speaker's title or role if the article gives one, else null.

Return a JSON array of objects matching this schema:
{schema}
{json_only}"#,
        article = article_text,
        topic = topic_name,
        schema = item_schema::<StatementItem>(),
        json_only = JSON_ONLY,
    )
}

pub fn topic_extraction_prompt(article_text: &str, max_topics: usize) -> String {
    format!(
        r#"
ARTICLE:
----------
{article}
----------

TASK: Name the topics this article is about, at most {max}.

GUIDELINES:
- A topic is a specific, lasting subject a reader could follow over time: a person,
  organization, place, policy, project or ongoing story.
- Use the most complete common name ("Springfield City Council", not "the council").
- "relevance" is a number between 0 and 1: how central the topic is to the article.
- Skip generic subjects such as "politics" or "news".

Return a JSON array of objects matching this schema:
{schema}
{json_only}"#,
        article = article_text,
        max = max_topics,
        schema = item_schema::<TopicItem>(),
        json_only = JSON_ONLY,
    )
}

pub fn extraction_prompt(request: &CapabilityRequest, max_topics: usize) -> String {
    let topic = request.topic_context.as_deref().unwrap_or("the main subject");
    match request.kind {
        TaskKind::EventExtraction => event_extraction_prompt(
            &request.article_text,
            &request.published_at.format("%A, %B %-d, %Y").to_string(),
            topic,
        ),
        TaskKind::StatementExtraction => statement_extraction_prompt(&request.article_text, topic),
        TaskKind::TopicExtraction => topic_extraction_prompt(&request.article_text, max_topics),
    }
}
