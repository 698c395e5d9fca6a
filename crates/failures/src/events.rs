//! Domain events raised by capture, bulk operations and retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recoverability_core::{ForwardingBatchId, GroupId, UniqueMessageId};
use recoverability_events::Event;

use crate::operation::OperationType;

/// Event: a message failed (first time or again).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFailed {
    pub unique_message_id: UniqueMessageId,
    pub failing_endpoint: String,
    pub number_of_attempts: usize,
    /// `true` when the record already existed before this failure.
    pub repeated: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: one batch of a group archive was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessageGroupBatchArchived {
    pub group_id: GroupId,
    pub message_ids: Vec<UniqueMessageId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a whole group archive completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessageGroupArchived {
    pub group_id: GroupId,
    pub group_name: String,
    pub messages_count: usize,
    pub occurred_at: DateTime<Utc>,
}

/// Event: one batch of a group unarchive was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessageGroupBatchUnarchived {
    pub group_id: GroupId,
    pub message_ids: Vec<UniqueMessageId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a whole group unarchive completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessageGroupUnarchived {
    pub group_id: GroupId,
    pub group_name: String,
    pub messages_count: usize,
    pub occurred_at: DateTime<Utc>,
}

/// Event: throttled progress of a running bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProgressed {
    pub group_id: GroupId,
    pub operation_type: OperationType,
    pub number_of_messages_processed: usize,
    pub total_number_of_messages: usize,
    pub current_batch: usize,
    pub number_of_batches: usize,
    pub occurred_at: DateTime<Utc>,
}

/// Event: messages were put on the staging queue for a retry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesStagedForRetry {
    pub forwarding_batch_id: ForwardingBatchId,
    pub number_of_messages: usize,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a staged message could not be redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRetryFailed {
    pub unique_message_id: UniqueMessageId,
    pub forwarding_batch_id: Option<ForwardingBatchId>,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a retried message was processed successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRetrySucceeded {
    pub unique_message_id: UniqueMessageId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoverabilityEvent {
    MessageFailed(MessageFailed),
    FailedMessageGroupBatchArchived(FailedMessageGroupBatchArchived),
    FailedMessageGroupArchived(FailedMessageGroupArchived),
    FailedMessageGroupBatchUnarchived(FailedMessageGroupBatchUnarchived),
    FailedMessageGroupUnarchived(FailedMessageGroupUnarchived),
    OperationProgressed(OperationProgressed),
    MessagesStagedForRetry(MessagesStagedForRetry),
    MessageRetryFailed(MessageRetryFailed),
    MessageRetrySucceeded(MessageRetrySucceeded),
}

impl Event for RecoverabilityEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RecoverabilityEvent::MessageFailed(e) if e.repeated => "recoverability.message.failed_repeatedly",
            RecoverabilityEvent::MessageFailed(_) => "recoverability.message.failed",
            RecoverabilityEvent::FailedMessageGroupBatchArchived(_) => "recoverability.group.batch_archived",
            RecoverabilityEvent::FailedMessageGroupArchived(_) => "recoverability.group.archived",
            RecoverabilityEvent::FailedMessageGroupBatchUnarchived(_) => "recoverability.group.batch_unarchived",
            RecoverabilityEvent::FailedMessageGroupUnarchived(_) => "recoverability.group.unarchived",
            RecoverabilityEvent::OperationProgressed(_) => "recoverability.operation.progressed",
            RecoverabilityEvent::MessagesStagedForRetry(_) => "recoverability.retry.staged",
            RecoverabilityEvent::MessageRetryFailed(_) => "recoverability.retry.failed",
            RecoverabilityEvent::MessageRetrySucceeded(_) => "recoverability.retry.succeeded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RecoverabilityEvent::MessageFailed(e) => e.occurred_at,
            RecoverabilityEvent::FailedMessageGroupBatchArchived(e) => e.occurred_at,
            RecoverabilityEvent::FailedMessageGroupArchived(e) => e.occurred_at,
            RecoverabilityEvent::FailedMessageGroupBatchUnarchived(e) => e.occurred_at,
            RecoverabilityEvent::FailedMessageGroupUnarchived(e) => e.occurred_at,
            RecoverabilityEvent::OperationProgressed(e) => e.occurred_at,
            RecoverabilityEvent::MessagesStagedForRetry(e) => e.occurred_at,
            RecoverabilityEvent::MessageRetryFailed(e) => e.occurred_at,
            RecoverabilityEvent::MessageRetrySucceeded(e) => e.occurred_at,
        }
    }
}
