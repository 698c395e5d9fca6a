//! Failure recoverability domain module.
//!
//! This crate contains the records the engine operates on and the pure rules
//! that govern them (attempt merging and bounding, batch planning, checkpoint
//! advancement). No IO, no async, no storage.

pub mod events;
pub mod group;
pub mod message;
pub mod operation;
pub mod retry;

pub use events::{
    FailedMessageGroupArchived, FailedMessageGroupBatchArchived, FailedMessageGroupBatchUnarchived,
    FailedMessageGroupUnarchived, MessageFailed, MessageRetryFailed, MessageRetrySucceeded,
    MessagesStagedForRetry, OperationProgressed, RecoverabilityEvent,
};
pub use group::FailureGroup;
pub use message::{
    AttemptOutcome, DEFAULT_MAX_PROCESSING_ATTEMPTS, ExceptionDetails, FailedMessage,
    FailedMessageStatus, FailureDetails, MessageMetadata, ProcessingAttempt,
};
pub use operation::{Operation, OperationBatch, OperationKey, OperationPlan, OperationType};
pub use retry::RetryBookkeeping;
