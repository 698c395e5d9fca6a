use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use recoverability_core::{ExpectedVersion, GroupId, UniqueMessageId, Versioned};
use recoverability_failures::{
    FailedMessage, FailedMessageStatus, FailureGroup, Operation, OperationKey, OperationPlan,
    RetryBookkeeping,
};

/// Failure record store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency check failed (version mismatch).
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// A create-only write found an existing document.
    #[error("document already exists: {0}")]
    AlreadyExists(String),

    #[error("document not found: {0}")]
    NotFound(String),

    /// The backend itself failed (IO, lock poisoning, serialization).
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Lost an optimistic-concurrency race (someone else wrote first).
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Concurrency(_) | StoreError::AlreadyExists(_))
    }
}

/// Durable store of failed messages, their bodies, bulk-operation checkpoints
/// and retry bookkeeping.
///
/// ## Design Principles
///
/// - **No storage assumptions**: any document/row store with optimistic
///   concurrency and an eventually consistent secondary index satisfies it.
/// - **Optimistic locking**: every mutable document is handed out as
///   [`Versioned`]; writers pass the version back as an [`ExpectedVersion`].
/// - **Eventually consistent groups**: group counts and memberships come from
///   the store's own index and may lag behind document writes.
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - reject a write whose `ExpectedVersion` does not match (`Concurrency`)
/// - create an operation checkpoint and its batches atomically, at most once
///   per key (`AlreadyExists` for the loser)
/// - only change documents currently in `from` during `apply_bulk_status`
#[async_trait]
pub trait FailureRecordStore: Send + Sync {
    /// Load a failed message with its version token.
    async fn load_failed_message(
        &self,
        id: UniqueMessageId,
    ) -> Result<Option<Versioned<FailedMessage>>, StoreError>;

    /// Write a failed message, returning the new version.
    async fn save_failed_message(
        &self,
        message: FailedMessage,
        expected: ExpectedVersion,
    ) -> Result<u64, StoreError>;

    /// Store the raw body of a failed message, keyed by its unique id.
    async fn store_body(&self, id: UniqueMessageId, body: Vec<u8>) -> Result<(), StoreError>;

    async fn load_body(&self, id: UniqueMessageId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Group metadata as last classified, if any member exists.
    async fn failure_group(&self, group_id: GroupId) -> Result<Option<FailureGroup>, StoreError>;

    /// Number of group members currently in `status` (index view).
    async fn group_member_count(
        &self,
        group_id: GroupId,
        status: FailedMessageStatus,
    ) -> Result<usize, StoreError>;

    /// Ids of group members currently in `status` (index view).
    async fn group_members(
        &self,
        group_id: GroupId,
        status: FailedMessageStatus,
    ) -> Result<Vec<UniqueMessageId>, StoreError>;

    /// Move every listed message that is in `from` to `to`; returns the number
    /// of documents changed. Ids in any other status or unknown are skipped.
    async fn apply_bulk_status(
        &self,
        ids: &[UniqueMessageId],
        from: FailedMessageStatus,
        to: FailedMessageStatus,
    ) -> Result<usize, StoreError>;

    /// Persist a new checkpoint plus its batches; fails if one exists for the key.
    async fn create_operation(&self, plan: OperationPlan) -> Result<Versioned<Operation>, StoreError>;

    async fn load_operation(&self, key: OperationKey) -> Result<Option<Versioned<Operation>>, StoreError>;

    async fn list_operations(&self) -> Result<Vec<Versioned<Operation>>, StoreError>;

    /// Overwrite a checkpoint under optimistic concurrency.
    async fn advance_operation(
        &self,
        operation: Operation,
        expected: ExpectedVersion,
    ) -> Result<Versioned<Operation>, StoreError>;

    /// Delete a checkpoint and its batches (no-op if absent).
    async fn remove_operation(&self, key: OperationKey) -> Result<(), StoreError>;

    /// Members of one batch; `None` when the batch is not (yet) visible.
    async fn batch_members(
        &self,
        key: OperationKey,
        batch_number: usize,
    ) -> Result<Option<Vec<UniqueMessageId>>, StoreError>;

    async fn save_retry(&self, record: RetryBookkeeping) -> Result<(), StoreError>;

    async fn load_retry(&self, id: UniqueMessageId) -> Result<Option<RetryBookkeeping>, StoreError>;

    /// Remove a retry record; returns whether one existed.
    async fn remove_retry(&self, id: UniqueMessageId) -> Result<bool, StoreError>;

    /// Wait until the index reports no member of `group_id` left in `status`.
    ///
    /// Returns `false` on timeout. Backends with a native staleness signal
    /// should override the polling default.
    async fn wait_for_consistency(
        &self,
        group_id: GroupId,
        status: FailedMessageStatus,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.group_member_count(group_id, status).await? == 0 {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[async_trait]
impl<S> FailureRecordStore for Arc<S>
where
    S: FailureRecordStore + ?Sized,
{
    async fn load_failed_message(
        &self,
        id: UniqueMessageId,
    ) -> Result<Option<Versioned<FailedMessage>>, StoreError> {
        (**self).load_failed_message(id).await
    }

    async fn save_failed_message(
        &self,
        message: FailedMessage,
        expected: ExpectedVersion,
    ) -> Result<u64, StoreError> {
        (**self).save_failed_message(message, expected).await
    }

    async fn store_body(&self, id: UniqueMessageId, body: Vec<u8>) -> Result<(), StoreError> {
        (**self).store_body(id, body).await
    }

    async fn load_body(&self, id: UniqueMessageId) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).load_body(id).await
    }

    async fn failure_group(&self, group_id: GroupId) -> Result<Option<FailureGroup>, StoreError> {
        (**self).failure_group(group_id).await
    }

    async fn group_member_count(
        &self,
        group_id: GroupId,
        status: FailedMessageStatus,
    ) -> Result<usize, StoreError> {
        (**self).group_member_count(group_id, status).await
    }

    async fn group_members(
        &self,
        group_id: GroupId,
        status: FailedMessageStatus,
    ) -> Result<Vec<UniqueMessageId>, StoreError> {
        (**self).group_members(group_id, status).await
    }

    async fn apply_bulk_status(
        &self,
        ids: &[UniqueMessageId],
        from: FailedMessageStatus,
        to: FailedMessageStatus,
    ) -> Result<usize, StoreError> {
        (**self).apply_bulk_status(ids, from, to).await
    }

    async fn create_operation(&self, plan: OperationPlan) -> Result<Versioned<Operation>, StoreError> {
        (**self).create_operation(plan).await
    }

    async fn load_operation(&self, key: OperationKey) -> Result<Option<Versioned<Operation>>, StoreError> {
        (**self).load_operation(key).await
    }

    async fn list_operations(&self) -> Result<Vec<Versioned<Operation>>, StoreError> {
        (**self).list_operations().await
    }

    async fn advance_operation(
        &self,
        operation: Operation,
        expected: ExpectedVersion,
    ) -> Result<Versioned<Operation>, StoreError> {
        (**self).advance_operation(operation, expected).await
    }

    async fn remove_operation(&self, key: OperationKey) -> Result<(), StoreError> {
        (**self).remove_operation(key).await
    }

    async fn batch_members(
        &self,
        key: OperationKey,
        batch_number: usize,
    ) -> Result<Option<Vec<UniqueMessageId>>, StoreError> {
        (**self).batch_members(key, batch_number).await
    }

    async fn save_retry(&self, record: RetryBookkeeping) -> Result<(), StoreError> {
        (**self).save_retry(record).await
    }

    async fn load_retry(&self, id: UniqueMessageId) -> Result<Option<RetryBookkeeping>, StoreError> {
        (**self).load_retry(id).await
    }

    async fn remove_retry(&self, id: UniqueMessageId) -> Result<bool, StoreError> {
        (**self).remove_retry(id).await
    }

    async fn wait_for_consistency(
        &self,
        group_id: GroupId,
        status: FailedMessageStatus,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool, StoreError> {
        (**self)
            .wait_for_consistency(group_id, status, timeout, poll_interval)
            .await
    }
}
