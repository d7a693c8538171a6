pub mod archive;
pub mod config;
pub mod db;
pub mod environment;
pub mod error;
pub mod extract;
pub mod feed;
pub mod ingest;
pub mod llm;
pub mod locks;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod prompts;
pub mod reconcile;
pub mod retry;
pub mod topic;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Settings;
pub use db::Database;
pub use feed::{SynthesisFeed, TimelineOrder};
pub use ingest::{IngestionCoordinator, IngestionOutcome, IngestionResult};
pub use model::{Article, Event, EventTime, Precision, Stance, Statement, Topic, TopicId};

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_LLM_REQUEST: &str = "llm_request";
pub const TARGET_DB: &str = "db_query";
pub const TARGET_INGEST: &str = "ingest";
pub const TARGET_TOPIC: &str = "topic";
pub const TARGET_RECONCILE: &str = "reconcile";
