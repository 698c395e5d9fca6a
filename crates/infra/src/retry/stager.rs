//! Staging of failed messages for a retry run.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use recoverability_core::{ForwardingBatchId, GroupId, UniqueMessageId};
use recoverability_events::EventBus;
use recoverability_failures::{
    FailedMessage, FailedMessageStatus, MessagesStagedForRetry, RecoverabilityEvent, RetryBookkeeping,
};

use super::transport::{MessageTransport, TransportError, TransportMessage};
use crate::capture::{CaptureError, FailureCapture};
use crate::headers::{self, Headers};
use crate::publisher::{RecoverabilityEnvelope, publish};
use crate::settings::RecoverabilitySettings;
use crate::store::{FailureRecordStore, StoreError, upsert_failed_message};

/// Bodies up to this size travel inside the staged message.
pub const DEFAULT_MAX_INLINE_BODY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Staging stopped part-way; `staged` messages are already queued and
    /// count towards the run.
    #[error("staging interrupted after {staged} message(s): {source}")]
    Interrupted {
        staged: usize,
        #[source]
        source: CaptureError,
    },
}

impl StagingError {
    /// Messages already on the staging queue when the error occurred.
    pub fn staged(&self) -> usize {
        match self {
            StagingError::Interrupted { staged, .. } => *staged,
            _ => 0,
        }
    }
}

/// Puts failed messages on the staging queue for the retry forwarder.
pub struct RetryStager<S, B, T> {
    capture: Arc<FailureCapture<S, B>>,
    transport: T,
    staging_queue: String,
    max_upsert_retries: usize,
    max_inline_body: usize,
}

impl<S, B, T> RetryStager<S, B, T>
where
    S: FailureRecordStore,
    B: EventBus<RecoverabilityEnvelope>,
    T: MessageTransport,
{
    pub fn new(capture: Arc<FailureCapture<S, B>>, transport: T, settings: &RecoverabilitySettings) -> Self {
        Self {
            capture,
            transport,
            staging_queue: settings.staging_queue.clone(),
            max_upsert_retries: settings.max_upsert_retries,
            max_inline_body: DEFAULT_MAX_INLINE_BODY,
        }
    }

    pub fn with_max_inline_body(mut self, bytes: usize) -> Self {
        self.max_inline_body = bytes;
        self
    }

    /// Stage every unresolved member of `group_id`.
    pub async fn stage_group(
        &self,
        batch_id: ForwardingBatchId,
        group_id: GroupId,
        destination_override: Option<&str>,
    ) -> Result<usize, StagingError> {
        let members = self
            .capture
            .store()
            .group_members(group_id, FailedMessageStatus::Unresolved)
            .await?;
        self.stage(batch_id, &members, destination_override).await
    }

    /// Mark `ids` as `RetryIssued` and send them to the staging queue.
    ///
    /// Messages that are unknown, archived or resolved are skipped. A message
    /// whose hand-off fails (bookkeeping, body or dispatch) is reverted to
    /// `Unresolved` and skipped. Returns the number staged, which is the run's
    /// expected count; if a status write fails, the error carries the count
    /// queued so far.
    pub async fn stage(
        &self,
        batch_id: ForwardingBatchId,
        ids: &[UniqueMessageId],
        destination_override: Option<&str>,
    ) -> Result<usize, StagingError> {
        let address = self.transport.resolve_address(&self.staging_queue)?;
        let mut staged = 0;

        for &id in ids {
            let message = match self.issue_retry(id).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(source) => return Err(self.interrupted(batch_id, ids.len(), staged, source)),
            };

            if let Err(e) = self.hand_off(batch_id, &message, destination_override, &address).await {
                warn!(unique_message_id = %id, error = %e, "could not stage message for retry, reverting");
                if let Err(source) = self.capture.revert_to_unresolved(id).await {
                    return Err(self.interrupted(batch_id, ids.len(), staged, source));
                }
                continue;
            }
            staged += 1;
        }

        self.announce(batch_id, ids.len(), staged);
        Ok(staged)
    }

    fn announce(&self, batch_id: ForwardingBatchId, requested: usize, staged: usize) {
        info!(forwarding_batch_id = %batch_id, requested, staged, "messages staged for retry");
        if staged > 0 {
            publish(
                self.capture.bus(),
                RecoverabilityEvent::MessagesStagedForRetry(MessagesStagedForRetry {
                    forwarding_batch_id: batch_id,
                    number_of_messages: staged,
                    occurred_at: Utc::now(),
                }),
            );
        }
    }

    fn interrupted(
        &self,
        batch_id: ForwardingBatchId,
        requested: usize,
        staged: usize,
        source: CaptureError,
    ) -> StagingError {
        error!(forwarding_batch_id = %batch_id, staged, error = %source, "staging interrupted");
        self.announce(batch_id, requested, staged);
        StagingError::Interrupted { staged, source }
    }

    /// Record the retry and put the message on the staging queue.
    async fn hand_off(
        &self,
        batch_id: ForwardingBatchId,
        message: &FailedMessage,
        destination_override: Option<&str>,
        address: &str,
    ) -> anyhow::Result<()> {
        self.capture
            .store()
            .save_retry(RetryBookkeeping {
                unique_message_id: *recoverability_core::Entity::id(message),
                forwarding_batch_id: batch_id,
                staged_at: Utc::now(),
                destination_override: destination_override.map(str::to_string),
            })
            .await?;

        let outgoing = self.staged_message(batch_id, message, destination_override).await?;
        self.transport.dispatch(outgoing, address).await
    }

    async fn issue_retry(&self, id: UniqueMessageId) -> Result<Option<FailedMessage>, CaptureError> {
        let staged = upsert_failed_message(self.capture.store(), id, self.max_upsert_retries, |previous| {
            let Some(mut message) = previous else {
                return (None, None);
            };
            match message.issue_retry() {
                Ok(()) => (Some(message.clone()), Some(message)),
                Err(e) => {
                    debug!(unique_message_id = %id, error = %e, "message not eligible for retry");
                    (None, None)
                }
            }
        })
        .await?;
        Ok(staged)
    }

    async fn staged_message(
        &self,
        batch_id: ForwardingBatchId,
        message: &FailedMessage,
        destination_override: Option<&str>,
    ) -> Result<TransportMessage, StoreError> {
        let id = *recoverability_core::Entity::id(message);
        let attempt = message.last_attempt();

        let mut staged_headers: Headers = attempt.headers.clone();
        staged_headers.insert(headers::STAGING_ID.to_string(), batch_id.to_string());
        staged_headers.insert(headers::UNIQUE_MESSAGE_ID.to_string(), id.to_string());
        staged_headers.insert(headers::ATTEMPT_ID.to_string(), attempt.native_message_id.clone());
        staged_headers.insert(
            headers::TARGET_ENDPOINT.to_string(),
            attempt.failure_details.address_of_failing_endpoint.clone(),
        );
        if let Some(destination) = destination_override {
            staged_headers.insert(headers::RETRY_TO.to_string(), destination.to_string());
        }

        let body = match self.capture.store().load_body(id).await? {
            Some(body) if body.len() <= self.max_inline_body => body,
            _ => {
                staged_headers.insert(headers::BODY_NOT_CARRIED.to_string(), "true".to_string());
                Vec::new()
            }
        };

        Ok(TransportMessage::new(attempt.native_message_id.clone(), staged_headers, body))
    }
}

#[cfg(test)]
mod tests {
    use recoverability_core::Entity;

    use super::*;
    use crate::retry::InMemoryTransport;
    use crate::store::InMemoryFailureStore;
    use crate::test_support::{FlakyStore, TestBus, bus, seed_group, timeout_group};

    type Stager = RetryStager<Arc<InMemoryFailureStore>, TestBus, Arc<InMemoryTransport>>;

    fn fixture() -> (Stager, Arc<InMemoryFailureStore>, Arc<InMemoryTransport>, TestBus) {
        let store = Arc::new(InMemoryFailureStore::new());
        let bus = bus();
        let transport = Arc::new(InMemoryTransport::new());
        let settings = RecoverabilitySettings::default();
        let capture = Arc::new(FailureCapture::new(store.clone(), bus.clone(), &settings));
        (RetryStager::new(capture, transport.clone(), &settings), store, transport, bus)
    }

    #[tokio::test]
    async fn stages_unresolved_messages_with_bookkeeping() {
        let (stager, store, transport, bus) = fixture();
        let events = bus.subscribe();
        let ids = seed_group(&store, &timeout_group(), 3).await;
        let batch_id = ForwardingBatchId::new();

        let staged = stager.stage(batch_id, &ids, Some("sales.v2")).await.unwrap();
        assert_eq!(staged, 3);

        let queued = transport.dispatched_to("recoverability.staging");
        assert_eq!(queued.len(), 3);
        let first = &queued[0];
        assert_eq!(first.header(headers::STAGING_ID), Some(batch_id.to_string().as_str()));
        assert_eq!(first.header(headers::TARGET_ENDPOINT), Some("sales"));
        assert_eq!(first.header(headers::RETRY_TO), Some("sales.v2"));
        assert_eq!(first.header(headers::BODY_NOT_CARRIED), None);
        assert!(!first.body.is_empty());

        for id in &ids {
            let message = store.load_failed_message(*id).await.unwrap().unwrap().into_document();
            assert_eq!(message.status(), FailedMessageStatus::RetryIssued);
            assert_eq!(store.load_retry(*id).await.unwrap().unwrap().forwarding_batch_id, batch_id);
        }
        assert_eq!(events.drain().len(), 1);
    }

    #[tokio::test]
    async fn archived_messages_are_not_staged() {
        let (stager, store, transport, _bus) = fixture();
        let ids = seed_group(&store, &timeout_group(), 2).await;
        store
            .apply_bulk_status(&ids[..1], FailedMessageStatus::Unresolved, FailedMessageStatus::Archived)
            .await
            .unwrap();

        let staged = stager.stage(ForwardingBatchId::new(), &ids, None).await.unwrap();
        assert_eq!(staged, 1);
        assert_eq!(transport.dispatched().len(), 1);
        assert!(store.load_retry(ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn large_bodies_stay_in_the_store() {
        let (stager, store, transport, _bus) = fixture();
        let stager = stager.with_max_inline_body(4);
        let ids = seed_group(&store, &timeout_group(), 1).await;

        stager.stage_group(ForwardingBatchId::new(), timeout_group().id, None).await.unwrap();

        let queued = transport.dispatched_to("recoverability.staging");
        assert_eq!(queued[0].header(headers::BODY_NOT_CARRIED), Some("true"));
        assert!(queued[0].body.is_empty());
        assert_eq!(queued[0].header(headers::UNIQUE_MESSAGE_ID), Some(ids[0].to_string().as_str()));
    }

    #[tokio::test]
    async fn staging_failure_reverts_the_message() {
        let (stager, store, transport, _bus) = fixture();
        transport.make_unreachable("recoverability.staging");
        let ids = seed_group(&store, &timeout_group(), 1).await;

        let staged = stager.stage(ForwardingBatchId::new(), &ids, None).await.unwrap();
        assert_eq!(staged, 0);

        let message = store.load_failed_message(ids[0]).await.unwrap().unwrap().into_document();
        assert_eq!(*message.id(), ids[0]);
        assert_eq!(message.status(), FailedMessageStatus::Unresolved);
        assert!(store.load_retry(ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bookkeeping_failure_reverts_only_that_message() {
        let store = Arc::new(FlakyStore::new());
        let bus = bus();
        let events = bus.subscribe();
        let transport = Arc::new(InMemoryTransport::new());
        let settings = RecoverabilitySettings::default();
        let capture = Arc::new(FailureCapture::new(store.clone(), bus, &settings));
        let stager = RetryStager::new(capture, transport.clone(), &settings);
        let ids = seed_group(&store, &timeout_group(), 3).await;
        store.fail_retry_save_for(ids[1]);

        let staged = stager.stage(ForwardingBatchId::new(), &ids, None).await.unwrap();
        assert_eq!(staged, 2);
        assert_eq!(transport.dispatched_to("recoverability.staging").len(), 2);

        let skipped = store.load_failed_message(ids[1]).await.unwrap().unwrap().into_document();
        assert_eq!(skipped.status(), FailedMessageStatus::Unresolved);
        assert!(store.load_retry(ids[1]).await.unwrap().is_none());
        for id in [ids[0], ids[2]] {
            let message = store.load_failed_message(id).await.unwrap().unwrap().into_document();
            assert_eq!(message.status(), FailedMessageStatus::RetryIssued);
        }

        let announced: Vec<_> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e.into_payload() {
                RecoverabilityEvent::MessagesStagedForRetry(m) => Some(m.number_of_messages),
                _ => None,
            })
            .collect();
        assert_eq!(announced, vec![2]);
    }

    #[test]
    fn interrupted_staging_reports_what_was_queued() {
        let err = StagingError::Interrupted {
            staged: 4,
            source: CaptureError::Contention {
                id: UniqueMessageId::from_parts("order-1", "sales"),
                attempts: 3,
            },
        };
        assert_eq!(err.staged(), 4);
        assert!(err.to_string().starts_with("staging interrupted after 4"));
        assert_eq!(StagingError::Store(StoreError::Storage("down".into())).staged(), 0);
    }
}
