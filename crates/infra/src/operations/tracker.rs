//! In-process registry of running bulk operations.
//!
//! The tracker is a cache for progress polling, not the source of truth: the
//! persisted checkpoint is authoritative and an entry missing after a restart
//! (or a dismissal) is rebuilt from it on demand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use recoverability_core::GroupId;
use recoverability_failures::{Operation, OperationKey, OperationType};

/// Where a tracked operation is in its lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Started,
    Progressing,
    Finalizing,
    Completed,
}

/// Point-in-time view of one operation, for polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSnapshot {
    pub request_id: GroupId,
    pub operation_type: OperationType,
    pub group_name: String,
    pub phase: OperationPhase,
    pub total_number_of_messages: usize,
    pub number_of_messages_processed: usize,
    pub number_of_batches: usize,
    pub current_batch: usize,
    pub started: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl OperationSnapshot {
    fn from_checkpoint(operation: &Operation, phase: OperationPhase) -> Self {
        Self {
            request_id: operation.request_id,
            operation_type: operation.operation_type,
            group_name: operation.group_name.clone(),
            phase,
            total_number_of_messages: operation.total_number_of_messages,
            number_of_messages_processed: operation.number_of_messages_processed,
            number_of_batches: operation.number_of_batches,
            current_batch: operation.current_batch,
            started: operation.started,
            last_updated: Utc::now(),
            completion_time: None,
        }
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.request_id, self.operation_type)
    }

    /// Share of messages processed, in `0.0..=1.0`.
    pub fn progress_percentage(&self) -> f64 {
        if self.total_number_of_messages == 0 {
            return 1.0;
        }
        (self.number_of_messages_processed as f64 / self.total_number_of_messages as f64).min(1.0)
    }
}

#[derive(Debug)]
struct TrackedOperation {
    snapshot: OperationSnapshot,
    last_progress_published: Option<Instant>,
}

/// Concurrent map of tracked operations, one lock per key.
#[derive(Debug, Default)]
pub struct OperationTracker {
    entries: RwLock<HashMap<OperationKey, Arc<Mutex<TrackedOperation>>>>,
}

// The tracker only caches data; a panic while holding one of its locks
// leaves nothing half-written that the checkpoint cannot rebuild.
fn lock(entry: &Mutex<TrackedOperation>) -> MutexGuard<'_, TrackedOperation> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &OperationKey) -> Option<Arc<Mutex<TrackedOperation>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn insert(&self, operation: &Operation, replace: bool) -> OperationSnapshot {
        let key = operation.key();
        let phase = if operation.current_batch == 0 {
            OperationPhase::Started
        } else {
            OperationPhase::Progressing
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !replace {
            if let Some(existing) = entries.get(&key) {
                return lock(existing).snapshot.clone();
            }
        }

        let snapshot = OperationSnapshot::from_checkpoint(operation, phase);
        entries.insert(
            key,
            Arc::new(Mutex::new(TrackedOperation {
                snapshot: snapshot.clone(),
                last_progress_published: None,
            })),
        );
        snapshot
    }

    /// Start tracking `operation` (fresh or resumed), replacing any stale entry.
    pub fn begin(&self, operation: &Operation) -> OperationSnapshot {
        self.insert(operation, true)
    }

    /// Rebuild a missing entry from a persisted checkpoint; keeps a live one.
    pub fn rehydrate(&self, operation: &Operation) -> OperationSnapshot {
        self.insert(operation, false)
    }

    /// Copy the checkpoint's counters into the entry, if still tracked.
    pub fn record_progress(&self, operation: &Operation) -> Option<OperationSnapshot> {
        let entry = self.entry(&operation.key())?;
        let mut tracked = lock(&entry);
        let s = &mut tracked.snapshot;
        s.number_of_messages_processed = operation.number_of_messages_processed;
        s.current_batch = operation.current_batch;
        s.number_of_batches = operation.number_of_batches;
        s.phase = OperationPhase::Progressing;
        s.last_updated = Utc::now();
        Some(s.clone())
    }

    pub fn finalizing(&self, key: &OperationKey) {
        if let Some(entry) = self.entry(key) {
            let mut tracked = lock(&entry);
            tracked.snapshot.phase = OperationPhase::Finalizing;
            tracked.snapshot.last_updated = Utc::now();
        }
    }

    /// Mark the operation completed and stop tracking it.
    pub fn complete(&self, key: &OperationKey) -> Option<OperationSnapshot> {
        let entry = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)?;

        let mut tracked = lock(&entry);
        let now = Utc::now();
        tracked.snapshot.phase = OperationPhase::Completed;
        tracked.snapshot.last_updated = now;
        tracked.snapshot.completion_time = Some(now);
        Some(tracked.snapshot.clone())
    }

    /// Forget an entry. Persisted checkpoints and running jobs are untouched.
    pub fn dismiss(&self, key: &OperationKey) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn snapshot(&self, key: &OperationKey) -> Option<OperationSnapshot> {
        self.entry(key).map(|e| lock(&e).snapshot.clone())
    }

    /// Snapshots of every tracked operation, oldest first.
    pub fn list(&self) -> Vec<OperationSnapshot> {
        let entries: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut snapshots: Vec<_> = entries.iter().map(|e| lock(e).snapshot.clone()).collect();
        snapshots.sort_by_key(|s| s.started);
        snapshots
    }

    pub fn is_in_progress(&self, group_id: GroupId, operation_type: OperationType) -> bool {
        self.snapshot(&OperationKey::new(group_id, operation_type))
            .is_some_and(|s| s.phase != OperationPhase::Completed)
    }

    /// Throttle for progress events: `true` at most once per `interval` per
    /// key, and always for the final batch.
    pub fn should_publish_progress(&self, key: &OperationKey, interval: Duration, is_final: bool) -> bool {
        let Some(entry) = self.entry(key) else {
            return is_final;
        };
        let mut tracked = lock(&entry);
        let now = Instant::now();
        let due = is_final
            || tracked
                .last_progress_published
                .is_none_or(|last| now.duration_since(last) >= interval);
        if due {
            tracked.last_progress_published = Some(now);
        }
        due
    }
}
