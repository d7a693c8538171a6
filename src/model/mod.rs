/// Declares a string-backed identifier newtype. Fresh ids are UUID v4.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

pub mod article;
pub mod event;
pub mod statement;
pub mod time;
pub mod topic;

pub use article::Article;
pub use event::{Event, EventCandidate, EventDetails, EventId, Provenance};
pub use statement::{Speaker, Stance, Statement, StatementCandidate, StatementId};
pub use time::{EventTime, Precision};
pub use topic::{Topic, TopicId};
