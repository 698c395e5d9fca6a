//! Archive and unarchive as two directions of the same bulk state change.

use chrono::Utc;

use recoverability_core::{GroupId, UniqueMessageId};
use recoverability_failures::{
    FailedMessageGroupArchived, FailedMessageGroupBatchArchived, FailedMessageGroupBatchUnarchived,
    FailedMessageGroupUnarchived, FailedMessageStatus, OperationType, RecoverabilityEvent,
};

/// Parameterizes [`super::BatchOrchestrator`] with the status transition and
/// the events it raises.
pub trait Direction: Send + Sync + 'static {
    const OPERATION_TYPE: OperationType;

    /// Status group members must be in to be picked up.
    fn source_status() -> FailedMessageStatus {
        Self::OPERATION_TYPE.source_status()
    }

    fn target_status() -> FailedMessageStatus {
        Self::OPERATION_TYPE.target_status()
    }

    fn batch_processed(group_id: GroupId, message_ids: Vec<UniqueMessageId>) -> RecoverabilityEvent;

    fn group_completed(group_id: GroupId, group_name: String, messages_count: usize) -> RecoverabilityEvent;
}

/// Unresolved -> Archived.
#[derive(Debug, Copy, Clone, Default)]
pub struct Archive;

/// Archived -> Unresolved.
#[derive(Debug, Copy, Clone, Default)]
pub struct Unarchive;

impl Direction for Archive {
    const OPERATION_TYPE: OperationType = OperationType::Archive;

    fn batch_processed(group_id: GroupId, message_ids: Vec<UniqueMessageId>) -> RecoverabilityEvent {
        RecoverabilityEvent::FailedMessageGroupBatchArchived(FailedMessageGroupBatchArchived {
            group_id,
            message_ids,
            occurred_at: Utc::now(),
        })
    }

    fn group_completed(group_id: GroupId, group_name: String, messages_count: usize) -> RecoverabilityEvent {
        RecoverabilityEvent::FailedMessageGroupArchived(FailedMessageGroupArchived {
            group_id,
            group_name,
            messages_count,
            occurred_at: Utc::now(),
        })
    }
}

impl Direction for Unarchive {
    const OPERATION_TYPE: OperationType = OperationType::Unarchive;

    fn batch_processed(group_id: GroupId, message_ids: Vec<UniqueMessageId>) -> RecoverabilityEvent {
        RecoverabilityEvent::FailedMessageGroupBatchUnarchived(FailedMessageGroupBatchUnarchived {
            group_id,
            message_ids,
            occurred_at: Utc::now(),
        })
    }

    fn group_completed(group_id: GroupId, group_name: String, messages_count: usize) -> RecoverabilityEvent {
        RecoverabilityEvent::FailedMessageGroupUnarchived(FailedMessageGroupUnarchived {
            group_id,
            group_name,
            messages_count,
            occurred_at: Utc::now(),
        })
    }
}
