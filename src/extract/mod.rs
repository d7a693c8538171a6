//! Turning article text into validated candidates.
//!
//! Each extractor makes one scheduled capability call and validates the
//! response item by item. Bad items become [`SoftExtractionFailure`]s; the
//! remaining items are still returned.

pub mod capability;
mod events;
pub mod schema;
mod statements;
pub mod time_expr;
mod topics;

pub use capability::{CapabilityRequest, CapabilityResponse, ExtractionCapability, TaskKind};
pub use events::{events_from_response, EventExtractor};
pub use statements::StatementExtractor;
pub use topics::{topics_from_response, DiscoveredTopic, TopicDiscovery};

use crate::error::SoftExtractionFailure;
use crate::retry::CallReport;

/// Result of one extraction call.
#[derive(Debug)]
pub struct Extraction<T> {
    pub candidates: Vec<T>,
    pub failures: Vec<SoftExtractionFailure>,
    pub call: CallReport,
}

impl<T> Extraction<T> {
    /// No candidates and no content failures; used when the call itself
    /// produced nothing to validate.
    pub(crate) fn empty(call: CallReport) -> Self {
        Self {
            candidates: Vec::new(),
            failures: Vec::new(),
            call,
        }
    }
}
