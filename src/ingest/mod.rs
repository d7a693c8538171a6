//! Per-article ingestion: topic resolution, extraction and reconciliation,
//! driven through an explicit state machine.

mod coordinator;
pub mod state;


pub use coordinator::{IngestionCoordinator, IngestionOutcome, IngestionResult, IngestionWarning};
pub use state::{ArticleMachine, IngestionState};
