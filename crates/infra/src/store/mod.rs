//! Failure record store abstraction and implementations.
//!
//! The store is the only durable state of the engine: failed messages and
//! their bodies, bulk-operation checkpoints (with their immutable batches) and
//! retry bookkeeping.

pub mod in_memory;
pub mod r#trait;
pub mod upsert;

pub use in_memory::InMemoryFailureStore;
pub use r#trait::{FailureRecordStore, StoreError};
pub use upsert::{UpsertError, upsert_failed_message};
