//! Building blocks shared by the recoverability engine.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the domain error model and optimistic-concurrency versioning.

pub mod entity;
pub mod error;
pub mod id;
pub mod version;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{ForwardingBatchId, GroupId, UniqueMessageId};
pub use version::{ExpectedVersion, Versioned};
