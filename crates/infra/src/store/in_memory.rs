use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use recoverability_core::{Entity, ExpectedVersion, GroupId, UniqueMessageId, Versioned};
use recoverability_failures::{
    FailedMessage, FailedMessageStatus, FailureGroup, Operation, OperationKey, OperationPlan,
    RetryBookkeeping,
};

use super::r#trait::{FailureRecordStore, StoreError};

#[derive(Debug, Default)]
struct Documents {
    messages: HashMap<UniqueMessageId, Versioned<FailedMessage>>,
    bodies: HashMap<UniqueMessageId, Vec<u8>>,
    operations: HashMap<OperationKey, Versioned<Operation>>,
    batches: HashMap<(OperationKey, usize), Vec<UniqueMessageId>>,
    retries: HashMap<UniqueMessageId, RetryBookkeeping>,
}

/// In-memory failure record store.
///
/// Intended for tests/dev. Group queries scan all documents, so the "index"
/// is always consistent; not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryFailureStore {
    docs: RwLock<Documents>,
}

impl InMemoryFailureStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Documents>, StoreError> {
        self.docs
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Documents>, StoreError> {
        self.docs
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    /// Number of failed-message documents (tests/diagnostics).
    pub fn message_count(&self) -> usize {
        self.read().map(|d| d.messages.len()).unwrap_or(0)
    }
}

fn members_in<'a>(
    docs: &'a Documents,
    group_id: GroupId,
    status: FailedMessageStatus,
) -> impl Iterator<Item = &'a FailedMessage> + 'a {
    docs.messages
        .values()
        .map(|v| &v.document)
        .filter(move |m| m.status() == status && m.belongs_to(group_id))
}

#[async_trait]
impl FailureRecordStore for InMemoryFailureStore {
    async fn load_failed_message(
        &self,
        id: UniqueMessageId,
    ) -> Result<Option<Versioned<FailedMessage>>, StoreError> {
        Ok(self.read()?.messages.get(&id).cloned())
    }

    async fn save_failed_message(
        &self,
        message: FailedMessage,
        expected: ExpectedVersion,
    ) -> Result<u64, StoreError> {
        let mut docs = self.write()?;
        let id = *message.id();
        let current = docs.messages.get(&id).map(|v| v.version);

        if !expected.matches(current) {
            return Err(StoreError::Concurrency(format!(
                "failed message {id}: expected {expected:?}, found {current:?}"
            )));
        }

        let next = current.unwrap_or(0) + 1;
        docs.messages.insert(id, Versioned::new(next, message));
        Ok(next)
    }

    async fn store_body(&self, id: UniqueMessageId, body: Vec<u8>) -> Result<(), StoreError> {
        self.write()?.bodies.insert(id, body);
        Ok(())
    }

    async fn load_body(&self, id: UniqueMessageId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()?.bodies.get(&id).cloned())
    }

    async fn failure_group(&self, group_id: GroupId) -> Result<Option<FailureGroup>, StoreError> {
        let docs = self.read()?;
        Ok(docs
            .messages
            .values()
            .flat_map(|v| v.document.failure_groups().iter())
            .find(|g| g.id == group_id)
            .cloned())
    }

    async fn group_member_count(
        &self,
        group_id: GroupId,
        status: FailedMessageStatus,
    ) -> Result<usize, StoreError> {
        let docs = self.read()?;
        Ok(members_in(&docs, group_id, status).count())
    }

    async fn group_members(
        &self,
        group_id: GroupId,
        status: FailedMessageStatus,
    ) -> Result<Vec<UniqueMessageId>, StoreError> {
        let docs = self.read()?;
        let mut ids: Vec<UniqueMessageId> = members_in(&docs, group_id, status).map(|m| *m.id()).collect();
        // Stable order so batch plans are reproducible.
        ids.sort();
        Ok(ids)
    }

    async fn apply_bulk_status(
        &self,
        ids: &[UniqueMessageId],
        from: FailedMessageStatus,
        to: FailedMessageStatus,
    ) -> Result<usize, StoreError> {
        let mut docs = self.write()?;
        let mut changed = 0;
        for id in ids {
            if let Some(entry) = docs.messages.get_mut(id) {
                if entry.document.transition(from, to) {
                    entry.version += 1;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn create_operation(&self, plan: OperationPlan) -> Result<Versioned<Operation>, StoreError> {
        let mut docs = self.write()?;
        let key = plan.operation.key();

        if docs.operations.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("operation {key}")));
        }

        for batch in plan.batches {
            docs.batches.insert((key, batch.batch_number), batch.message_ids);
        }
        let stored = Versioned::new(1, plan.operation);
        docs.operations.insert(key, stored.clone());
        Ok(stored)
    }

    async fn load_operation(&self, key: OperationKey) -> Result<Option<Versioned<Operation>>, StoreError> {
        Ok(self.read()?.operations.get(&key).cloned())
    }

    async fn list_operations(&self) -> Result<Vec<Versioned<Operation>>, StoreError> {
        let docs = self.read()?;
        let mut ops: Vec<_> = docs.operations.values().cloned().collect();
        ops.sort_by_key(|o| o.document.started);
        Ok(ops)
    }

    async fn advance_operation(
        &self,
        operation: Operation,
        expected: ExpectedVersion,
    ) -> Result<Versioned<Operation>, StoreError> {
        let mut docs = self.write()?;
        let key = operation.key();
        let current = docs.operations.get(&key).map(|o| o.version);

        if current.is_none() {
            return Err(StoreError::NotFound(format!("operation {key}")));
        }
        if !expected.matches(current) {
            return Err(StoreError::Concurrency(format!(
                "operation {key}: expected {expected:?}, found {current:?}"
            )));
        }
        let stored_batch = docs.operations.get(&key).map_or(0, |o| o.document.current_batch);
        if operation.current_batch < stored_batch {
            return Err(StoreError::Concurrency(format!(
                "operation {key}: cannot move back from batch {stored_batch} to {}",
                operation.current_batch
            )));
        }

        let stored = Versioned::new(current.unwrap_or(0) + 1, operation);
        docs.operations.insert(key, stored.clone());
        Ok(stored)
    }

    async fn remove_operation(&self, key: OperationKey) -> Result<(), StoreError> {
        let mut docs = self.write()?;
        docs.operations.remove(&key);
        docs.batches.retain(|(k, _), _| *k != key);
        Ok(())
    }

    async fn batch_members(
        &self,
        key: OperationKey,
        batch_number: usize,
    ) -> Result<Option<Vec<UniqueMessageId>>, StoreError> {
        Ok(self.read()?.batches.get(&(key, batch_number)).cloned())
    }

    async fn save_retry(&self, record: RetryBookkeeping) -> Result<(), StoreError> {
        self.write()?.retries.insert(record.unique_message_id, record);
        Ok(())
    }

    async fn load_retry(&self, id: UniqueMessageId) -> Result<Option<RetryBookkeeping>, StoreError> {
        Ok(self.read()?.retries.get(&id).cloned())
    }

    async fn remove_retry(&self, id: UniqueMessageId) -> Result<bool, StoreError> {
        Ok(self.write()?.retries.remove(&id).is_some())
    }
}
