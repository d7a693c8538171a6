mod article;
pub mod core;
mod event;
pub mod ingestion;
mod schema;
mod statement;
pub mod topic;

pub use self::core::{Database, DbLockErrorExt, StoreStats};
pub use self::ingestion::{CallRecord, IngestionRecord};
pub use self::topic::{AliasRow, TopicMergeCounts};
