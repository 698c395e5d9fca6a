//! Resumable batch orchestration of archive/unarchive over a failure group.
//!
//! ```text
//! Uninitialized -> Splitting -> Executing(batch i) -> Finalizing -> Completed
//! ```
//!
//! The persisted [`Operation`] checkpoint is the only resumption state:
//! `current_batch` is advanced (compare-and-swap) after each batch is applied,
//! so an invocation that dies mid-way is resumed at the same batch by the next
//! one. Re-applying a batch is harmless since the bulk status change only
//! touches documents still in the source status.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use recoverability_core::{DomainError, GroupId, Versioned};
use recoverability_events::EventBus;
use recoverability_failures::{
    Operation, OperationKey, OperationPlan, OperationProgressed, RecoverabilityEvent,
};

use super::direction::Direction;
use super::tracker::OperationTracker;
use crate::publisher::{RecoverabilityEnvelope, publish};
use crate::settings::RecoverabilitySettings;
use crate::store::{FailureRecordStore, StoreError};

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The store failed; the checkpoint was not advanced past the failing batch.
    #[error("store failure during {key}: {source}")]
    Store {
        key: OperationKey,
        #[source]
        source: StoreError,
    },

    #[error("cannot plan {key}: {source}")]
    Domain {
        key: OperationKey,
        #[source]
        source: DomainError,
    },
}

impl OrchestrationError {
    pub fn key(&self) -> OperationKey {
        match self {
            OrchestrationError::Store { key, .. } | OrchestrationError::Domain { key, .. } => *key,
        }
    }
}

/// How an orchestration invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationOutcome {
    /// No checkpoint and no member in the source status.
    NothingToDo,
    /// This invocation drove the operation to completion.
    Completed {
        group_name: String,
        messages_processed: usize,
        number_of_batches: usize,
    },
    /// Another invocation finished (and removed) the checkpoint first.
    CompletedElsewhere,
}

/// Drives one direction of the bulk state change for any group.
///
/// Different groups may be orchestrated concurrently; batches of one group
/// run strictly in order.
pub struct BatchOrchestrator<D, S, B> {
    store: S,
    bus: B,
    tracker: Arc<OperationTracker>,
    settings: RecoverabilitySettings,
    _direction: PhantomData<fn() -> D>,
}

impl<D, S, B> BatchOrchestrator<D, S, B>
where
    D: Direction,
    S: FailureRecordStore,
    B: EventBus<RecoverabilityEnvelope>,
{
    pub fn new(store: S, bus: B, tracker: Arc<OperationTracker>, settings: RecoverabilitySettings) -> Self {
        Self {
            store,
            bus,
            tracker,
            settings,
            _direction: PhantomData,
        }
    }

    pub fn key(group_id: GroupId) -> OperationKey {
        OperationKey::new(group_id, D::OPERATION_TYPE)
    }

    /// Start or resume the operation for `group_id` and run it to completion.
    ///
    /// On error nothing past the last completed batch is recorded; calling
    /// `run` again resumes from the checkpoint.
    pub async fn run(&self, group_id: GroupId) -> Result<OrchestrationOutcome, OrchestrationError> {
        let key = Self::key(group_id);
        let result = self.drive(key).await;
        if let Err(e) = &result {
            error!(operation = %key, error = %e, "orchestration aborted, checkpoint left for resumption");
        }
        result
    }

    async fn drive(&self, key: OperationKey) -> Result<OrchestrationOutcome, OrchestrationError> {
        let store_err = |source: StoreError| OrchestrationError::Store { key, source };

        let checkpoint = match self.store.load_operation(key).await.map_err(store_err)? {
            Some(existing) => {
                info!(
                    operation = %key,
                    batch = existing.document.current_batch,
                    batches = existing.document.number_of_batches,
                    "resuming operation from checkpoint"
                );
                existing
            }
            None => match self.split(key).await? {
                Some(created) => created,
                None => return Ok(OrchestrationOutcome::NothingToDo),
            },
        };

        self.tracker.begin(&checkpoint.document);

        let Some(checkpoint) = self.execute(key, checkpoint).await? else {
            self.tracker.complete(&key);
            return Ok(OrchestrationOutcome::CompletedElsewhere);
        };

        self.finalize(key).await;
        self.complete(key, checkpoint.into_document()).await
    }

    /// Persist a new checkpoint, or adopt the one a concurrent caller created.
    async fn split(&self, key: OperationKey) -> Result<Option<Versioned<Operation>>, OrchestrationError> {
        let store_err = |source: StoreError| OrchestrationError::Store { key, source };
        let group_id = key.request_id;

        let count = self
            .store
            .group_member_count(group_id, D::source_status())
            .await
            .map_err(store_err)?;
        if count == 0 {
            info!(operation = %key, "group has no members to process, nothing to do");
            return Ok(None);
        }

        let members = self
            .store
            .group_members(group_id, D::source_status())
            .await
            .map_err(store_err)?;
        let group_name = self
            .store
            .failure_group(group_id)
            .await
            .map_err(store_err)?
            .map(|g| g.title)
            .unwrap_or_else(|| group_id.to_string());

        if members.is_empty() {
            debug!(operation = %key, "members left the group before it could be split");
            return Ok(None);
        }

        let plan = OperationPlan::split(key, group_name, members, self.settings.batch_size, Utc::now())
            .map_err(|source| OrchestrationError::Domain { key, source })?;
        let total = plan.operation.total_number_of_messages;
        let batches = plan.operation.number_of_batches;

        match self.store.create_operation(plan).await {
            Ok(created) => {
                info!(operation = %key, messages = total, batches, "operation split into batches");
                Ok(Some(created))
            }
            Err(e) if e.is_conflict() => {
                debug!(operation = %key, "checkpoint created concurrently, adopting it");
                self.store.load_operation(key).await.map_err(store_err)
            }
            Err(e) => Err(store_err(e)),
        }
    }

    /// Apply batches until the checkpoint says all are done.
    ///
    /// Returns `None` when the checkpoint disappeared underneath us, which
    /// only happens when a concurrent invocation completed the operation.
    async fn execute(
        &self,
        key: OperationKey,
        mut checkpoint: Versioned<Operation>,
    ) -> Result<Option<Versioned<Operation>>, OrchestrationError> {
        let store_err = |source: StoreError| OrchestrationError::Store { key, source };

        while !checkpoint.document.is_complete() {
            let batch = checkpoint.document.current_batch;

            let message_ids = match self.store.batch_members(key, batch).await.map_err(store_err)? {
                Some(ids) => ids,
                None => {
                    warn!(operation = %key, batch, "batch not visible in store yet, counting it as empty");
                    Vec::new()
                }
            };

            if !message_ids.is_empty() {
                let changed = self
                    .store
                    .apply_bulk_status(&message_ids, D::source_status(), D::target_status())
                    .await
                    .map_err(store_err)?;
                debug!(operation = %key, batch, messages = message_ids.len(), changed, "batch applied");
            }

            let mut next = checkpoint.document.clone();
            next.advance(message_ids.len())
                .map_err(|source| OrchestrationError::Domain { key, source })?;

            checkpoint = match self.store.advance_operation(next, checkpoint.expected()).await {
                Ok(advanced) => advanced,
                Err(e) if e.is_conflict() || matches!(e, StoreError::NotFound(_)) => {
                    debug!(operation = %key, batch, error = %e, "checkpoint moved concurrently, reloading");
                    match self.store.load_operation(key).await.map_err(store_err)? {
                        Some(reloaded) => reloaded,
                        None => return Ok(None),
                    }
                }
                Err(e) => return Err(store_err(e)),
            };

            self.tracker.record_progress(&checkpoint.document);
            publish(&self.bus, D::batch_processed(key.request_id, message_ids));

            let op = &checkpoint.document;
            let is_final = op.is_complete();
            if self
                .tracker
                .should_publish_progress(&key, self.settings.progress_publish_interval, is_final)
            {
                publish(
                    &self.bus,
                    RecoverabilityEvent::OperationProgressed(OperationProgressed {
                        group_id: key.request_id,
                        operation_type: key.operation_type,
                        number_of_messages_processed: op.number_of_messages_processed,
                        total_number_of_messages: op.total_number_of_messages,
                        current_batch: op.current_batch,
                        number_of_batches: op.number_of_batches,
                        occurred_at: Utc::now(),
                    }),
                );
            }
        }

        Ok(Some(checkpoint))
    }

    /// Wait (bounded) for the store's index to stop reporting members in the
    /// source status. Advisory only: a timeout or error is logged and ignored.
    async fn finalize(&self, key: OperationKey) {
        self.tracker.finalizing(&key);

        let waited = self
            .store
            .wait_for_consistency(
                key.request_id,
                D::source_status(),
                self.settings.finalize_timeout,
                self.settings.consistency_poll_interval,
            )
            .await;

        match waited {
            Ok(true) => debug!(operation = %key, "store index caught up"),
            Ok(false) => warn!(
                operation = %key,
                timeout_secs = self.settings.finalize_timeout.as_secs(),
                "store index did not catch up before timeout, completing anyway"
            ),
            Err(e) => warn!(operation = %key, error = %e, "could not check store index, completing anyway"),
        }
    }

    async fn complete(
        &self,
        key: OperationKey,
        operation: Operation,
    ) -> Result<OrchestrationOutcome, OrchestrationError> {
        publish(
            &self.bus,
            D::group_completed(key.request_id, operation.group_name.clone(), operation.total_number_of_messages),
        );

        self.store
            .remove_operation(key)
            .await
            .map_err(|source| OrchestrationError::Store { key, source })?;
        self.tracker.complete(&key);

        info!(
            operation = %key,
            group = %operation.group_name,
            messages = operation.number_of_messages_processed,
            "operation completed"
        );

        Ok(OrchestrationOutcome::Completed {
            group_name: operation.group_name,
            messages_processed: operation.number_of_messages_processed,
            number_of_batches: operation.number_of_batches,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use recoverability_failures::{FailedMessageStatus, OperationType};

    use super::*;
    use crate::operations::{Archive, Unarchive};
    use crate::test_support::{FlakyStore, TestBus, bus, seed_group, timeout_group};

    fn settings(batch_size: usize) -> RecoverabilitySettings {
        RecoverabilitySettings::default()
            .with_batch_size(batch_size)
            .with_finalize_timeout(Duration::from_millis(50))
            .with_consistency_poll_interval(Duration::from_millis(5))
    }

    fn archiver(store: Arc<FlakyStore>, bus: TestBus, batch_size: usize) -> BatchOrchestrator<Archive, Arc<FlakyStore>, TestBus> {
        BatchOrchestrator::new(store, bus, Arc::new(OperationTracker::new()), settings(batch_size))
    }

    #[tokio::test]
    async fn archives_a_group_batch_by_batch() {
        let store = Arc::new(FlakyStore::new());
        let bus = bus();
        let events = bus.subscribe();
        let group = timeout_group();
        seed_group(&store, &group, 2500).await;

        let outcome = archiver(store.clone(), bus, 1000).run(group.id).await.unwrap();

        assert_eq!(
            outcome,
            OrchestrationOutcome::Completed {
                group_name: "TimeoutException".into(),
                messages_processed: 2500,
                number_of_batches: 3,
            }
        );
        assert_eq!(store.batches_read(), vec![0, 1, 2]);
        assert_eq!(store.group_member_count(group.id, FailedMessageStatus::Unresolved).await.unwrap(), 0);
        assert_eq!(store.group_member_count(group.id, FailedMessageStatus::Archived).await.unwrap(), 2500);

        let key = OperationKey::new(group.id, OperationType::Archive);
        assert!(store.load_operation(key).await.unwrap().is_none());

        let types: Vec<String> = events.drain().iter().map(|e| e.event_type().to_string()).collect();
        assert_eq!(types.iter().filter(|t| *t == "recoverability.group.batch_archived").count(), 3);
        assert_eq!(types.last().map(String::as_str), Some("recoverability.group.archived"));
    }

    #[tokio::test]
    async fn failed_batch_leaves_checkpoint_for_resumption() {
        let store = Arc::new(FlakyStore::new());
        let group = timeout_group();
        seed_group(&store, &group, 2500).await;
        let orchestrator = archiver(store.clone(), bus(), 1000);
        let key = OperationKey::new(group.id, OperationType::Archive);

        store.fail_bulk_on_call(2);
        let err = orchestrator.run(group.id).await.unwrap_err();
        assert_eq!(err.key(), key);

        let checkpoint = store.load_operation(key).await.unwrap().unwrap();
        assert_eq!(checkpoint.document.current_batch, 1);
        assert_eq!(checkpoint.document.number_of_batches, 3);

        store.heal();
        orchestrator.run(group.id).await.unwrap();

        // Batch 0 is never re-read; batch 1 is retried.
        assert_eq!(store.batches_read(), vec![0, 1, 1, 2]);
        assert_eq!(store.group_member_count(group.id, FailedMessageStatus::Archived).await.unwrap(), 2500);
        assert!(store.load_operation(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lagging_batch_counts_as_empty() {
        let store = Arc::new(FlakyStore::new());
        let group = timeout_group();
        seed_group(&store, &group, 5).await;
        store.hide_batch(1);

        let outcome = archiver(store.clone(), bus(), 2).run(group.id).await.unwrap();

        assert!(matches!(
            outcome,
            OrchestrationOutcome::Completed { messages_processed: 3, number_of_batches: 3, .. }
        ));
        // The hidden batch's members are left for the next pass.
        assert_eq!(store.group_member_count(group.id, FailedMessageStatus::Unresolved).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_group_is_a_no_op() {
        let store = Arc::new(FlakyStore::new());
        let outcome = archiver(store.clone(), bus(), 10).run(timeout_group().id).await.unwrap();
        assert_eq!(outcome, OrchestrationOutcome::NothingToDo);
        assert_eq!(store.operations_created(), 0);
    }

    #[tokio::test]
    async fn unarchive_reverses_archive() {
        let store = Arc::new(FlakyStore::new());
        let group = timeout_group();
        seed_group(&store, &group, 7).await;
        let tracker = Arc::new(OperationTracker::new());

        archiver(store.clone(), bus(), 3).run(group.id).await.unwrap();

        let unarchiver: BatchOrchestrator<Unarchive, _, _> =
            BatchOrchestrator::new(store.clone(), bus(), tracker.clone(), settings(3));
        let outcome = unarchiver.run(group.id).await.unwrap();

        assert!(matches!(outcome, OrchestrationOutcome::Completed { messages_processed: 7, .. }));
        assert_eq!(store.group_member_count(group.id, FailedMessageStatus::Unresolved).await.unwrap(), 7);
        assert!(!tracker.is_in_progress(group.id, OperationType::Unarchive));
    }

    #[tokio::test]
    async fn progress_is_published_for_the_final_batch() {
        let store = Arc::new(FlakyStore::new());
        let bus = bus();
        let events = bus.subscribe();
        let group = timeout_group();
        seed_group(&store, &group, 4).await;

        archiver(store, bus, 1).run(group.id).await.unwrap();

        let progressed: Vec<_> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e.into_payload() {
                RecoverabilityEvent::OperationProgressed(p) => Some(p),
                _ => None,
            })
            .collect();
        // First batch (never published before) and the final one; the rest fall
        // inside the throttle window.
        assert_eq!(progressed.len(), 2);
        assert_eq!(progressed[1].current_batch, 4);
        assert_eq!(progressed[1].number_of_messages_processed, 4);
    }
}
