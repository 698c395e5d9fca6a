//! Merge-based upsert of failed messages.
//!
//! Instead of overwriting a document, writers pass a pure merge function over
//! the previous version. The merge runs against the latest document and is
//! saved with a compare-and-swap on its version token; on conflict the
//! document is reloaded and the merge re-run.

use thiserror::Error;
use tracing::debug;

use recoverability_core::{ExpectedVersion, UniqueMessageId};
use recoverability_failures::FailedMessage;

use super::r#trait::{FailureRecordStore, StoreError};

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Every attempt lost the race against a concurrent writer.
    #[error("failed message {id}: gave up after {attempts} conflicting writes")]
    RetriesExhausted { id: UniqueMessageId, attempts: usize },
}

/// Load, merge and save `id` until the write wins.
///
/// `merge` receives the current document (if any) and returns the document to
/// store plus an arbitrary outcome, or `None` to skip the write entirely (the
/// merge decided nothing changes). Returns the outcome of the winning merge.
pub async fn upsert_failed_message<S, F, T>(
    store: &S,
    id: UniqueMessageId,
    max_retries: usize,
    mut merge: F,
) -> Result<T, UpsertError>
where
    S: FailureRecordStore + ?Sized,
    F: FnMut(Option<FailedMessage>) -> (Option<FailedMessage>, T),
{
    let attempts = max_retries.max(1);

    for attempt in 1..=attempts {
        let current = store.load_failed_message(id).await?;
        let expected = match &current {
            Some(versioned) => versioned.expected(),
            None => ExpectedVersion::NoDocument,
        };

        let (next, outcome) = merge(current.map(|v| v.into_document()));
        let Some(next) = next else {
            return Ok(outcome);
        };

        match store.save_failed_message(next, expected).await {
            Ok(_) => return Ok(outcome),
            Err(e) if e.is_conflict() => {
                debug!(unique_message_id = %id, attempt, error = %e, "failed message write lost a race, reloading");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(UpsertError::RetriesExhausted { id, attempts })
}
