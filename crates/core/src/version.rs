//! Optimistic concurrency primitives.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for a stored document.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (useful for idempotent writes, migrations, etc.).
    Any,
    /// The document must not exist yet.
    NoDocument,
    /// Require the document to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Check the expectation against the current version (`None` = absent).
    pub fn matches(self, actual: Option<u64>) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoDocument => actual.is_none(),
            ExpectedVersion::Exact(v) => actual == Some(v),
        }
    }

    pub fn check(self, actual: Option<u64>) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual:?})"
            )))
        }
    }
}

/// A document paired with the version token the store handed out with it.
///
/// Writers pass `ExpectedVersion::Exact(version)` back to the store; a write
/// that lost a race fails instead of overwriting the winner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub document: T,
}

impl<T> Versioned<T> {
    pub fn new(version: u64, document: T) -> Self {
        Self { version, document }
    }

    pub fn expected(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.version)
    }

    pub fn into_document(self) -> T {
        self.document
    }
}
