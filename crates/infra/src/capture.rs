//! Capture & grouping of failed processing attempts.
//!
//! Every failed delivery lands here. The attempt is merged into the message's
//! [`FailedMessage`] record (created on first failure), the raw body is stored
//! next to it and a `MessageFailed` event is raised. The compensating
//! counterparts used by retries (`record_successful_retry`,
//! `revert_to_unresolved`) live here too so every status write to a failed
//! message goes through the same merge discipline.

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use recoverability_core::UniqueMessageId;
use recoverability_events::EventBus;
use recoverability_failures::{
    AttemptOutcome, FailedMessage, FailedMessageStatus, FailureGroup, MessageFailed,
    MessageRetrySucceeded, ProcessingAttempt, RecoverabilityEvent,
};

use crate::headers::{self, Headers};
use crate::publisher::{RecoverabilityEnvelope, publish};
use crate::settings::RecoverabilitySettings;
use crate::store::{FailureRecordStore, StoreError, UpsertError, upsert_failed_message};

/// Raw transport view of the failed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub headers: Headers,
    pub body: Vec<u8>,
    pub native_message_id: String,
}

impl MessageContext {
    pub fn new(native_message_id: impl Into<String>, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            headers,
            body,
            native_message_id: native_message_id.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The message carries no usable identity (message id or failing endpoint).
    #[error("cannot identify failed message: missing {0}")]
    MissingIdentity(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gave up merging failed message {id} after {attempts} conflicting writes")]
    Contention { id: UniqueMessageId, attempts: usize },
}

impl From<UpsertError> for CaptureError {
    fn from(value: UpsertError) -> Self {
        match value {
            UpsertError::Store(e) => CaptureError::Store(e),
            UpsertError::RetriesExhausted { id, attempts } => CaptureError::Contention { id, attempts },
        }
    }
}

/// Result of recording one failed attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CaptureReceipt {
    pub unique_message_id: UniqueMessageId,
    pub outcome: AttemptOutcome,
    /// Attempts retained on the record after the merge.
    pub number_of_attempts: usize,
}

/// Entry point for everything that writes a failed message's status.
pub struct FailureCapture<S, B> {
    store: S,
    bus: B,
    max_processing_attempts: usize,
    max_upsert_retries: usize,
}

impl<S, B> FailureCapture<S, B>
where
    S: FailureRecordStore,
    B: EventBus<RecoverabilityEnvelope>,
{
    pub fn new(store: S, bus: B, settings: &RecoverabilitySettings) -> Self {
        Self {
            store,
            bus,
            max_processing_attempts: settings.max_processing_attempts,
            max_upsert_retries: settings.max_upsert_retries,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Merge a failed attempt into its record and store the raw body.
    ///
    /// Duplicate deliveries (same `attempted_at`) leave the record untouched
    /// and raise no event. Any new failure re-opens the record. Out-of-order
    /// attempts older than the newest one only extend the history.
    ///
    /// The body is written whenever the attempt is the newest one retained,
    /// duplicates included, so it always belongs to `last_attempt()` and a
    /// redelivery after a failed body write repairs it.
    pub async fn record_failed_attempt(
        &self,
        ctx: MessageContext,
        attempt: ProcessingAttempt,
        groups: Vec<FailureGroup>,
    ) -> Result<CaptureReceipt, CaptureError> {
        let id = identify(&ctx, &attempt)?;
        let failing_endpoint = attempt.failure_details.address_of_failing_endpoint.clone();
        let attempted_at = attempt.attempted_at;
        let max = self.max_processing_attempts;

        let (outcome, number_of_attempts, newest) =
            upsert_failed_message(&self.store, id, self.max_upsert_retries, |previous| {
                let (merged, outcome) =
                    FailedMessage::merge_attempt(previous, id, attempt.clone(), groups.clone(), max);
                let count = merged.processing_attempts().len();
                let newest = merged.last_attempt().attempted_at == attempted_at;
                let changed = match outcome {
                    AttemptOutcome::Duplicate => false,
                    AttemptOutcome::Stale => merged.has_attempt(attempted_at),
                    AttemptOutcome::Created | AttemptOutcome::Appended => true,
                };
                let receipt = (outcome, count, newest);
                if changed { (Some(merged), receipt) } else { (None, receipt) }
            })
            .await?;

        if newest {
            self.store.store_body(id, ctx.body).await?;
        }

        let receipt = CaptureReceipt {
            unique_message_id: id,
            outcome,
            number_of_attempts,
        };

        match outcome {
            AttemptOutcome::Duplicate => {
                debug!(unique_message_id = %id, native_message_id = %ctx.native_message_id, "duplicate failed attempt ignored");
                return Ok(receipt);
            }
            AttemptOutcome::Stale => {
                debug!(
                    unique_message_id = %id,
                    native_message_id = %ctx.native_message_id,
                    attempted_at = %attempted_at,
                    "out-of-order failed attempt folded into history"
                );
                return Ok(receipt);
            }
            AttemptOutcome::Created | AttemptOutcome::Appended => {}
        }

        info!(
            unique_message_id = %id,
            endpoint = %failing_endpoint,
            attempts = number_of_attempts,
            repeated = outcome == AttemptOutcome::Appended,
            "failed message recorded"
        );

        publish(
            &self.bus,
            RecoverabilityEvent::MessageFailed(MessageFailed {
                unique_message_id: id,
                failing_endpoint,
                number_of_attempts,
                repeated: outcome == AttemptOutcome::Appended,
                occurred_at: Utc::now(),
            }),
        );

        Ok(receipt)
    }

    /// Mark a retried message as resolved and drop its retry bookkeeping.
    ///
    /// Returns `false` when the message is unknown or already resolved.
    pub async fn record_successful_retry(&self, id: UniqueMessageId) -> Result<bool, CaptureError> {
        let resolved = upsert_failed_message(&self.store, id, self.max_upsert_retries, |previous| {
            let Some(mut message) = previous else {
                return (None, false);
            };
            if message.resolve() { (Some(message), true) } else { (None, false) }
        })
        .await?;

        self.store.remove_retry(id).await?;

        if resolved {
            info!(unique_message_id = %id, "retry confirmed, failed message resolved");
            publish(
                &self.bus,
                RecoverabilityEvent::MessageRetrySucceeded(MessageRetrySucceeded {
                    unique_message_id: id,
                    occurred_at: Utc::now(),
                }),
            );
        }
        Ok(resolved)
    }

    /// Compensate a failed redelivery: put a `RetryIssued` message back to
    /// `Unresolved` and drop its retry bookkeeping.
    ///
    /// Messages in any other status are left alone, so reverting twice (or
    /// reverting a message that failed again in the meantime) is a no-op.
    pub async fn revert_to_unresolved(&self, id: UniqueMessageId) -> Result<bool, CaptureError> {
        let reverted = upsert_failed_message(&self.store, id, self.max_upsert_retries, |previous| {
            let Some(mut message) = previous else {
                return (None, false);
            };
            if message.transition(FailedMessageStatus::RetryIssued, FailedMessageStatus::Unresolved) {
                (Some(message), true)
            } else {
                (None, false)
            }
        })
        .await?;

        self.store.remove_retry(id).await?;

        if reverted {
            warn!(unique_message_id = %id, "retry compensated, failed message back to unresolved");
        } else {
            debug!(unique_message_id = %id, "revert skipped, message not awaiting retry");
        }
        Ok(reverted)
    }
}

/// Identity of the failed message carried by `ctx`.
///
/// The id comes from the `MessageId` header (falling back to the id in the
/// attempt); the endpoint from `FailedQ`, then `ProcessingEndpoint`, then
/// the failing address in the failure details.
pub fn identify(ctx: &MessageContext, attempt: &ProcessingAttempt) -> Result<UniqueMessageId, CaptureError> {
    let message_id = headers::first_present(&ctx.headers, &[headers::MESSAGE_ID])
        .or_else(|| Some(attempt.message_id.trim()).filter(|s| !s.is_empty()))
        .ok_or(CaptureError::MissingIdentity("message id"))?;

    let failing_address = attempt.failure_details.address_of_failing_endpoint.trim();
    let endpoint = headers::first_present(&ctx.headers, &[headers::FAILED_QUEUE, headers::PROCESSING_ENDPOINT])
        .or_else(|| Some(failing_address).filter(|s| !s.is_empty()))
        .ok_or(CaptureError::MissingIdentity("failing endpoint"))?;

    Ok(UniqueMessageId::from_parts(message_id, endpoint))
}

/// Failed message a processed message was a retry of, if any.
pub fn retry_confirmation(incoming: &Headers) -> Option<UniqueMessageId> {
    headers::first_present(incoming, &[headers::RETRY_OF]).and_then(|v| v.parse().ok())
}
