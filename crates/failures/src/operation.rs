//! Bulk operation checkpoints and batch planning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recoverability_core::{DomainError, DomainResult, GroupId, UniqueMessageId};

use crate::message::FailedMessageStatus;

/// Kind of bulk state change performed over a failure group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Archive,
    Unarchive,
}

impl OperationType {
    /// Status a message must be in to be picked up by this operation.
    pub fn source_status(self) -> FailedMessageStatus {
        match self {
            OperationType::Archive => FailedMessageStatus::Unresolved,
            OperationType::Unarchive => FailedMessageStatus::Archived,
        }
    }

    /// Status the operation moves messages into.
    pub fn target_status(self) -> FailedMessageStatus {
        match self {
            OperationType::Archive => FailedMessageStatus::Archived,
            OperationType::Unarchive => FailedMessageStatus::Unresolved,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Archive => "archive",
            OperationType::Unarchive => "unarchive",
        }
    }
}

impl core::fmt::Display for OperationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an operation: the group acted on plus the direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    pub request_id: GroupId,
    pub operation_type: OperationType,
}

impl OperationKey {
    pub fn new(request_id: GroupId, operation_type: OperationType) -> Self {
        Self {
            request_id,
            operation_type,
        }
    }
}

impl core::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.operation_type, self.request_id)
    }
}

/// Persisted resumption state of one bulk operation.
///
/// The operation is a checkpoint, not a log: `current_batch` is the index of
/// the next batch to execute and only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub request_id: GroupId,
    pub operation_type: OperationType,
    pub group_name: String,
    pub total_number_of_messages: usize,
    pub number_of_messages_processed: usize,
    pub number_of_batches: usize,
    pub current_batch: usize,
    pub started: DateTime<Utc>,
}

impl Operation {
    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.request_id, self.operation_type)
    }

    pub fn is_complete(&self) -> bool {
        self.current_batch >= self.number_of_batches
    }

    /// Record that batch `current_batch` has been applied.
    pub fn advance(&mut self, processed: usize) -> DomainResult<()> {
        if self.is_complete() {
            return Err(DomainError::invariant(format!(
                "operation {} already completed all {} batches",
                self.key(),
                self.number_of_batches
            )));
        }
        self.current_batch += 1;
        self.number_of_messages_processed += processed;
        Ok(())
    }
}

/// A fixed-size, immutable slice of a group's members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    pub request_id: GroupId,
    pub operation_type: OperationType,
    pub batch_number: usize,
    pub message_ids: Vec<UniqueMessageId>,
}

impl OperationBatch {
    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.request_id, self.operation_type)
    }
}

/// A new operation together with the batches it will execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPlan {
    pub operation: Operation,
    pub batches: Vec<OperationBatch>,
}

impl OperationPlan {
    /// Split `members` into batches of `batch_size` and build the checkpoint.
    pub fn split(
        key: OperationKey,
        group_name: impl Into<String>,
        members: Vec<UniqueMessageId>,
        batch_size: usize,
        started: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if batch_size == 0 {
            return Err(DomainError::validation("batch size must be greater than zero"));
        }
        if members.is_empty() {
            return Err(DomainError::validation(format!("group {} has no members", key.request_id)));
        }

        let total = members.len();
        let batches: Vec<OperationBatch> = members
            .chunks(batch_size)
            .enumerate()
            .map(|(batch_number, ids)| OperationBatch {
                request_id: key.request_id,
                operation_type: key.operation_type,
                batch_number,
                message_ids: ids.to_vec(),
            })
            .collect();

        let operation = Operation {
            request_id: key.request_id,
            operation_type: key.operation_type,
            group_name: group_name.into(),
            total_number_of_messages: total,
            number_of_messages_processed: 0,
            number_of_batches: batches.len(),
            current_batch: 0,
            started,
        };

        Ok(Self { operation, batches })
    }
}
