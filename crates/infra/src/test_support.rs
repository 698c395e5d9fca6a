//! Shared fixtures for unit and scenario tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Barrier;

use recoverability_core::{ExpectedVersion, GroupId, UniqueMessageId, Versioned};
use recoverability_events::InMemoryEventBus;
use recoverability_failures::{
    ExceptionDetails, FailedMessage, FailedMessageStatus, FailureDetails, FailureGroup, Operation,
    OperationKey, OperationPlan, ProcessingAttempt, RetryBookkeeping,
};

use crate::publisher::RecoverabilityEnvelope;
use crate::store::{FailureRecordStore, InMemoryFailureStore, StoreError};

pub type TestBus = Arc<InMemoryEventBus<RecoverabilityEnvelope>>;

pub fn bus() -> TestBus {
    Arc::new(InMemoryEventBus::new())
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn timeout_group() -> FailureGroup {
    FailureGroup::classified("Exception Type", "TimeoutException")
}

pub fn attempt(message_id: &str, endpoint: &str, secs: i64) -> ProcessingAttempt {
    ProcessingAttempt::new(
        message_id,
        format!("native-{message_id}-{secs}"),
        at(secs),
        FailureDetails {
            exception: ExceptionDetails {
                exception_type: "TimeoutException".into(),
                message: "operation timed out".into(),
                source: None,
                stack_trace: None,
            },
            address_of_failing_endpoint: endpoint.into(),
            time_of_failure: at(secs),
        },
    )
}

/// Store `n` unresolved failed messages in `group`, with bodies.
pub async fn seed_group<S>(store: &S, group: &FailureGroup, n: usize) -> Vec<UniqueMessageId>
where
    S: FailureRecordStore + ?Sized,
{
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let message_id = format!("{}-{i}", group.title);
        let id = UniqueMessageId::from_parts(&message_id, "sales");
        let message = FailedMessage::first_failure(id, attempt(&message_id, "sales", 0), vec![group.clone()]);
        store.save_failed_message(message, ExpectedVersion::NoDocument).await.unwrap();
        store.store_body(id, message_id.into_bytes()).await.unwrap();
        ids.push(id);
    }
    ids
}

/// In-memory store with fault injection and call accounting.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryFailureStore,
    /// 1-based `apply_bulk_status` call that fails.
    fail_bulk_on_call: Mutex<Option<usize>>,
    bulk_calls: AtomicUsize,
    hidden_batches: Mutex<HashSet<usize>>,
    batches_read: Mutex<Vec<usize>>,
    operations_created: AtomicUsize,
    create_barrier: Option<Arc<Barrier>>,
    fail_next_body_write: AtomicBool,
    fail_retry_save_for: Mutex<HashSet<UniqueMessageId>>,
    /// The next `load_operation` hit deletes the checkpoint after reading it.
    complete_after_next_load: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `create_operation` holds each caller until `parties` callers reached it.
    pub fn with_create_barrier(parties: usize) -> Self {
        Self {
            create_barrier: Some(Arc::new(Barrier::new(parties))),
            ..Self::default()
        }
    }

    pub fn fail_bulk_on_call(&self, call: usize) {
        *self.fail_bulk_on_call.lock().unwrap() = Some(call);
    }

    pub fn heal(&self) {
        *self.fail_bulk_on_call.lock().unwrap() = None;
    }

    pub fn hide_batch(&self, batch: usize) {
        self.hidden_batches.lock().unwrap().insert(batch);
    }

    pub fn batches_read(&self) -> Vec<usize> {
        self.batches_read.lock().unwrap().clone()
    }

    pub fn operations_created(&self) -> usize {
        self.operations_created.load(Ordering::SeqCst)
    }

    pub fn fail_next_body_write(&self) {
        self.fail_next_body_write.store(true, Ordering::SeqCst);
    }

    /// The next `save_retry` for `id` fails.
    pub fn fail_retry_save_for(&self, id: UniqueMessageId) {
        self.fail_retry_save_for.lock().unwrap().insert(id);
    }

    /// Emulates an operation completing between a reader's load and its use.
    pub fn complete_after_next_load(&self) {
        self.complete_after_next_load.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl FailureRecordStore for FlakyStore {
    async fn load_failed_message(&self, id: UniqueMessageId) -> Result<Option<Versioned<FailedMessage>>, StoreError> {
        self.inner.load_failed_message(id).await
    }

    async fn save_failed_message(&self, message: FailedMessage, expected: ExpectedVersion) -> Result<u64, StoreError> {
        self.inner.save_failed_message(message, expected).await
    }

    async fn store_body(&self, id: UniqueMessageId, body: Vec<u8>) -> Result<(), StoreError> {
        if self.fail_next_body_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Storage(format!("injected body write failure for {id}")));
        }
        self.inner.store_body(id, body).await
    }

    async fn load_body(&self, id: UniqueMessageId) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load_body(id).await
    }

    async fn failure_group(&self, group_id: GroupId) -> Result<Option<FailureGroup>, StoreError> {
        self.inner.failure_group(group_id).await
    }

    async fn group_member_count(&self, group_id: GroupId, status: FailedMessageStatus) -> Result<usize, StoreError> {
        self.inner.group_member_count(group_id, status).await
    }

    async fn group_members(
        &self,
        group_id: GroupId,
        status: FailedMessageStatus,
    ) -> Result<Vec<UniqueMessageId>, StoreError> {
        self.inner.group_members(group_id, status).await
    }

    async fn apply_bulk_status(
        &self,
        ids: &[UniqueMessageId],
        from: FailedMessageStatus,
        to: FailedMessageStatus,
    ) -> Result<usize, StoreError> {
        let call = self.bulk_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = *self.fail_bulk_on_call.lock().unwrap() == Some(call);
        if fail {
            return Err(StoreError::Storage(format!("injected failure on bulk call {call}")));
        }
        self.inner.apply_bulk_status(ids, from, to).await
    }

    async fn create_operation(&self, plan: OperationPlan) -> Result<Versioned<Operation>, StoreError> {
        if let Some(barrier) = &self.create_barrier {
            barrier.wait().await;
        }
        let result = self.inner.create_operation(plan).await;
        if result.is_ok() {
            self.operations_created.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn load_operation(&self, key: OperationKey) -> Result<Option<Versioned<Operation>>, StoreError> {
        let loaded = self.inner.load_operation(key).await?;
        if loaded.is_some() && self.complete_after_next_load.swap(false, Ordering::SeqCst) {
            self.inner.remove_operation(key).await?;
        }
        Ok(loaded)
    }

    async fn list_operations(&self) -> Result<Vec<Versioned<Operation>>, StoreError> {
        self.inner.list_operations().await
    }

    async fn advance_operation(
        &self,
        operation: Operation,
        expected: ExpectedVersion,
    ) -> Result<Versioned<Operation>, StoreError> {
        self.inner.advance_operation(operation, expected).await
    }

    async fn remove_operation(&self, key: OperationKey) -> Result<(), StoreError> {
        self.inner.remove_operation(key).await
    }

    async fn batch_members(
        &self,
        key: OperationKey,
        batch_number: usize,
    ) -> Result<Option<Vec<UniqueMessageId>>, StoreError> {
        self.batches_read.lock().unwrap().push(batch_number);
        let hidden = self.hidden_batches.lock().unwrap().contains(&batch_number);
        if hidden {
            return Ok(None);
        }
        self.inner.batch_members(key, batch_number).await
    }

    async fn save_retry(&self, record: RetryBookkeeping) -> Result<(), StoreError> {
        let fail = self.fail_retry_save_for.lock().unwrap().remove(&record.unique_message_id);
        if fail {
            return Err(StoreError::Storage(format!("injected retry save failure for {}", record.unique_message_id)));
        }
        self.inner.save_retry(record).await
    }

    async fn load_retry(&self, id: UniqueMessageId) -> Result<Option<RetryBookkeeping>, StoreError> {
        self.inner.load_retry(id).await
    }

    async fn remove_retry(&self, id: UniqueMessageId) -> Result<bool, StoreError> {
        self.inner.remove_retry(id).await
    }
}
