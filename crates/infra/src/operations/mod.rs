//! Bulk archive/unarchive operations and their progress tracking.

pub mod direction;
pub mod orchestrator;
pub mod tracker;

pub use direction::{Archive, Direction, Unarchive};
pub use orchestrator::{BatchOrchestrator, OrchestrationError, OrchestrationOutcome};
pub use tracker::{OperationPhase, OperationSnapshot, OperationTracker};
