//! Operator-facing entry points of the engine.
//!
//! `Recoverability` wires capture, bulk operations and retries over one store,
//! one event bus and one transport, and exposes the calls an API layer needs.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use recoverability_core::{ForwardingBatchId, GroupId, UniqueMessageId};
use recoverability_events::EventBus;
use recoverability_failures::{OperationKey, OperationType};

use crate::capture::FailureCapture;
use crate::operations::{
    Archive, BatchOrchestrator, OperationSnapshot, OperationTracker, OrchestrationError,
    OrchestrationOutcome, Unarchive,
};
use crate::publisher::RecoverabilityEnvelope;
use crate::retry::{ForwarderError, MessageTransport, RetryForwarder, RetryRun, RetryStager, RunSummary, StagingError};
use crate::settings::RecoverabilitySettings;
use crate::store::{FailureRecordStore, StoreError};

pub type OrchestrationResult = Result<OrchestrationOutcome, OrchestrationError>;

pub struct Recoverability<S, B, T> {
    store: S,
    tracker: Arc<OperationTracker>,
    capture: Arc<FailureCapture<S, B>>,
    archiver: Arc<BatchOrchestrator<Archive, S, B>>,
    unarchiver: Arc<BatchOrchestrator<Unarchive, S, B>>,
    stager: RetryStager<S, B, T>,
    forwarder: Arc<RetryForwarder<S, B, T>>,
}

impl<S, B, T> Recoverability<S, B, T>
where
    S: FailureRecordStore + Clone + 'static,
    B: EventBus<RecoverabilityEnvelope> + Clone + 'static,
    T: MessageTransport + Clone + 'static,
{
    pub fn new(store: S, bus: B, transport: T, settings: RecoverabilitySettings) -> Self {
        let tracker = Arc::new(OperationTracker::new());
        let capture = Arc::new(FailureCapture::new(store.clone(), bus.clone(), &settings));

        Self {
            archiver: Arc::new(BatchOrchestrator::new(
                store.clone(),
                bus.clone(),
                tracker.clone(),
                settings.clone(),
            )),
            unarchiver: Arc::new(BatchOrchestrator::new(
                store.clone(),
                bus,
                tracker.clone(),
                settings.clone(),
            )),
            stager: RetryStager::new(capture.clone(), transport.clone(), &settings),
            forwarder: Arc::new(RetryForwarder::new(capture.clone(), transport, &settings)),
            store,
            tracker,
            capture,
        }
    }

    /// Capture & grouping entry points (failed attempts, retry confirmations).
    pub fn capture(&self) -> &FailureCapture<S, B> {
        &self.capture
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.tracker
    }

    /// Archive `group_id` in the background.
    pub fn start_archive(&self, group_id: GroupId) -> JoinHandle<OrchestrationResult> {
        let archiver = self.archiver.clone();
        tokio::spawn(async move { archiver.run(group_id).await })
    }

    pub async fn run_archive(&self, group_id: GroupId) -> OrchestrationResult {
        self.archiver.run(group_id).await
    }

    /// Unarchive `group_id` in the background.
    pub fn start_unarchive(&self, group_id: GroupId) -> JoinHandle<OrchestrationResult> {
        let unarchiver = self.unarchiver.clone();
        tokio::spawn(async move { unarchiver.run(group_id).await })
    }

    pub async fn run_unarchive(&self, group_id: GroupId) -> OrchestrationResult {
        self.unarchiver.run(group_id).await
    }

    /// Stop tracking an operation. The checkpoint and any running job are
    /// left alone.
    pub fn dismiss_operation(&self, group_id: GroupId, operation_type: OperationType) -> bool {
        let key = OperationKey::new(group_id, operation_type);
        let dismissed = self.tracker.dismiss(&key);
        if dismissed {
            info!(operation = %key, "operation dismissed");
        }
        dismissed
    }

    /// Progress of an operation, rebuilding the tracker entry from the
    /// checkpoint when it is missing (restart, dismissal).
    ///
    /// An operation that completes while the checkpoint is being read is
    /// reported as gone and leaves no entry behind.
    pub async fn get_operation_status(
        &self,
        group_id: GroupId,
        operation_type: OperationType,
    ) -> Result<Option<OperationSnapshot>, StoreError> {
        let key = OperationKey::new(group_id, operation_type);
        if let Some(snapshot) = self.tracker.snapshot(&key) {
            return Ok(Some(snapshot));
        }

        let Some(checkpoint) = self.store.load_operation(key).await? else {
            return Ok(None);
        };
        let snapshot = self.tracker.rehydrate(&checkpoint.document);

        // Completion removes the checkpoint before the entry.
        if self.store.load_operation(key).await?.is_none() {
            self.tracker.dismiss(&key);
            debug!(operation = %key, "operation completed while polled, entry dropped");
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    pub fn list_operations(&self) -> Vec<OperationSnapshot> {
        self.tracker.list()
    }

    /// Resume every operation with a persisted checkpoint, concurrently.
    pub async fn resume_pending(&self) -> Result<Vec<(OperationKey, OrchestrationResult)>, StoreError> {
        let pending = self.store.list_operations().await?;
        info!(operations = pending.len(), "resuming pending operations");

        let mut jobs = JoinSet::new();
        for checkpoint in pending {
            let key = checkpoint.document.key();
            match key.operation_type {
                OperationType::Archive => {
                    let archiver = self.archiver.clone();
                    jobs.spawn(async move { (key, archiver.run(key.request_id).await) });
                }
                OperationType::Unarchive => {
                    let unarchiver = self.unarchiver.clone();
                    jobs.spawn(async move { (key, unarchiver.run(key.request_id).await) });
                }
            }
        }

        let mut results = Vec::new();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "resumed operation panicked"),
            }
        }
        Ok(results)
    }

    /// Stage `ids` for retry under `batch_id`; returns the expected count.
    pub async fn stage_retry(
        &self,
        batch_id: ForwardingBatchId,
        ids: &[UniqueMessageId],
        destination_override: Option<&str>,
    ) -> Result<usize, StagingError> {
        self.stager.stage(batch_id, ids, destination_override).await
    }

    /// Stage every unresolved member of a group for retry.
    pub async fn stage_group_retry(
        &self,
        batch_id: ForwardingBatchId,
        group_id: GroupId,
        destination_override: Option<&str>,
    ) -> Result<usize, StagingError> {
        self.stager.stage_group(batch_id, group_id, destination_override).await
    }

    /// Start the forwarder (if needed) and run `run` in the background.
    pub fn start_retry_run(
        &self,
        run: RetryRun,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<RunSummary, ForwarderError>> {
        let forwarder = self.forwarder.clone();
        tokio::spawn(async move {
            forwarder.start().await?;
            forwarder.run(run, cancel).await
        })
    }

    /// Close the staging receiver.
    pub async fn stop_forwarder(&self) -> Result<(), ForwarderError> {
        self.forwarder.stop().await
    }
}
