//! End-to-end scenarios across capture, bulk operations and retries.
//!
//! Verifies:
//! - An archive that dies mid-way resumes from its checkpoint in a fresh engine
//! - Concurrent starts of one operation create a single checkpoint
//! - Retry runs stop on their expected count or after the idle timeout
//! - Failed redeliveries are compensated, successful ones confirmed
//! - A status poll racing an operation's completion leaves nothing behind

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use recoverability_core::{ForwardingBatchId, UniqueMessageId};
    use recoverability_events::EventBus;
    use recoverability_failures::{FailedMessageStatus, OperationType, RecoverabilityEvent};

    use crate::capture::{MessageContext, retry_confirmation};
    use crate::control::Recoverability;
    use crate::headers::Headers;
    use crate::operations::OrchestrationOutcome;
    use crate::retry::{InMemoryTransport, RetryRun, RunEnd};
    use crate::settings::RecoverabilitySettings;
    use crate::store::FailureRecordStore;
    use crate::test_support::{FlakyStore, TestBus, attempt, bus, seed_group, timeout_group};

    type Engine = Recoverability<Arc<FlakyStore>, TestBus, Arc<InMemoryTransport>>;

    fn settings(batch_size: usize) -> RecoverabilitySettings {
        RecoverabilitySettings::default()
            .with_batch_size(batch_size)
            .with_finalize_timeout(Duration::from_millis(50))
            .with_consistency_poll_interval(Duration::from_millis(5))
    }

    fn engine(store: Arc<FlakyStore>, bus: TestBus, transport: Arc<InMemoryTransport>) -> Engine {
        Recoverability::new(store, bus, transport, settings(1000))
    }

    async fn status(store: &FlakyStore, id: UniqueMessageId) -> FailedMessageStatus {
        store.load_failed_message(id).await.unwrap().unwrap().document.status()
    }

    #[tokio::test]
    async fn archive_resumes_in_a_fresh_engine_after_a_crash() {
        let store = Arc::new(FlakyStore::new());
        let group = timeout_group();
        seed_group(&store, &group, 2500).await;

        store.fail_bulk_on_call(2);
        let first = engine(store.clone(), bus(), Arc::new(InMemoryTransport::new()));
        assert!(first.run_archive(group.id).await.is_err());
        drop(first);

        store.heal();
        let second = engine(store.clone(), bus(), Arc::new(InMemoryTransport::new()));

        let status_after_restart = second
            .get_operation_status(group.id, OperationType::Archive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status_after_restart.current_batch, 1);
        assert_eq!(status_after_restart.total_number_of_messages, 2500);

        let resumed = second.resume_pending().await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert!(matches!(
            resumed[0].1,
            Ok(OrchestrationOutcome::Completed { messages_processed: 2500, number_of_batches: 3, .. })
        ));

        assert_eq!(store.batches_read(), vec![0, 1, 1, 2]);
        assert_eq!(store.group_member_count(group.id, FailedMessageStatus::Unresolved).await.unwrap(), 0);
        assert!(second.list_operations().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_share_one_checkpoint() {
        const CALLERS: usize = 8;
        let store = Arc::new(FlakyStore::with_create_barrier(CALLERS));
        let group = timeout_group();
        seed_group(&store, &group, 50).await;
        let engine = Recoverability::new(store.clone(), bus(), Arc::new(InMemoryTransport::new()), settings(10));

        let handles: Vec<_> = (0..CALLERS).map(|_| engine.start_archive(group.id)).collect();
        let mut completed = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            if matches!(outcome, OrchestrationOutcome::Completed { .. }) {
                completed += 1;
            }
        }

        assert_eq!(store.operations_created(), 1);
        assert!(completed >= 1);
        assert_eq!(store.group_member_count(group.id, FailedMessageStatus::Archived).await.unwrap(), 50);
        assert!(store.list_operations().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn counting_run_stops_without_waiting_for_the_idle_timeout() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let engine = engine(store.clone(), bus(), transport.clone());
        let group = timeout_group();
        seed_group(&store, &group, 5).await;

        let batch = ForwardingBatchId::new();
        let expected = engine.stage_group_retry(batch, group.id, None).await.unwrap();
        assert_eq!(expected, 5);

        let started = Instant::now();
        let summary = engine
            .start_retry_run(RetryRun::new(batch).with_expected_count(expected), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.end, RunEnd::Completed);
        assert_eq!(summary.forwarded, 5);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.dispatched_to("sales").len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn uncounted_run_stops_after_silence_following_the_last_message() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let engine = engine(store.clone(), bus(), transport.clone());
        let ids = seed_group(&store, &timeout_group(), 2).await;

        let batch = ForwardingBatchId::new();
        engine.stage_retry(batch, &ids[..1], None).await.unwrap();

        let started = Instant::now();
        let run = engine.start_retry_run(RetryRun::new(batch), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(20)).await;
        engine.stage_retry(batch, &ids[1..], None).await.unwrap();

        let summary = run.await.unwrap().unwrap();
        let elapsed = started.elapsed();

        assert_eq!(summary.end, RunEnd::Completed);
        assert_eq!(summary.forwarded, 2);
        let expected = Duration::from_secs(65);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "run ended after {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn failed_redelivery_reverts_the_message_and_still_counts() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let bus = bus();
        let events = bus.subscribe();
        let engine = engine(store.clone(), bus, transport.clone());
        let ids = seed_group(&store, &timeout_group(), 2).await;
        transport.make_unreachable("billing");

        let batch = ForwardingBatchId::new();
        engine.stage_retry(batch, &ids[..1], Some("billing")).await.unwrap();
        engine.stage_retry(batch, &ids[1..], None).await.unwrap();

        let summary = engine
            .start_retry_run(RetryRun::new(batch).with_expected_count(2), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.end, RunEnd::Completed);
        assert_eq!((summary.forwarded, summary.failed), (1, 1));
        assert_eq!(status(&store, ids[0]).await, FailedMessageStatus::Unresolved);
        assert_eq!(status(&store, ids[1]).await, FailedMessageStatus::RetryIssued);
        assert!(store.load_retry(ids[0]).await.unwrap().is_none());

        let failures: Vec<_> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e.into_payload() {
                RecoverabilityEvent::MessageRetryFailed(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].unique_message_id, ids[0]);
        assert_eq!(failures[0].forwarding_batch_id, Some(batch));
        assert!(failures[0].reason.contains("unreachable"), "reason: {}", failures[0].reason);
    }

    #[tokio::test]
    async fn confirmed_retry_resolves_the_message() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let engine = engine(store.clone(), bus(), transport.clone());
        let ids = seed_group(&store, &timeout_group(), 1).await;

        let batch = ForwardingBatchId::new();
        engine.stage_retry(batch, &ids, None).await.unwrap();
        assert!(store.load_retry(ids[0]).await.unwrap().is_some());

        engine
            .start_retry_run(RetryRun::new(batch).with_expected_count(1), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let redelivered = transport.dispatched_to("sales");
        assert_eq!(redelivered.len(), 1);

        // The endpoint processed the redelivered message and reports back.
        let confirmed = retry_confirmation(&redelivered[0].headers).unwrap();
        assert_eq!(confirmed, ids[0]);
        assert!(engine.capture().record_successful_retry(confirmed).await.unwrap());

        assert_eq!(status(&store, ids[0]).await, FailedMessageStatus::Resolved);
        assert!(store.load_retry(ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dismissed_operation_reappears_from_its_checkpoint() {
        let store = Arc::new(FlakyStore::new());
        let group = timeout_group();
        seed_group(&store, &group, 2500).await;
        let engine = engine(store.clone(), bus(), Arc::new(InMemoryTransport::new()));

        store.fail_bulk_on_call(2);
        assert!(engine.run_archive(group.id).await.is_err());

        assert!(engine.dismiss_operation(group.id, OperationType::Archive));
        assert!(engine.list_operations().is_empty());
        assert!(!engine.dismiss_operation(group.id, OperationType::Archive));

        let polled = engine
            .get_operation_status(group.id, OperationType::Archive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(polled.current_batch, 1);
        assert_eq!(engine.list_operations().len(), 1);

        assert!(
            engine
                .get_operation_status(group.id, OperationType::Unarchive)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn poll_racing_completion_leaves_no_entry() {
        let store = Arc::new(FlakyStore::new());
        let group = timeout_group();
        seed_group(&store, &group, 2500).await;
        let engine = engine(store.clone(), bus(), Arc::new(InMemoryTransport::new()));

        store.fail_bulk_on_call(2);
        assert!(engine.run_archive(group.id).await.is_err());
        assert!(engine.dismiss_operation(group.id, OperationType::Archive));

        store.complete_after_next_load();
        let polled = engine.get_operation_status(group.id, OperationType::Archive).await.unwrap();

        assert!(polled.is_none());
        assert!(engine.list_operations().is_empty());
        assert!(store.list_operations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stage_failure_mid_batch_leaves_no_message_awaiting_retry() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let engine = engine(store.clone(), bus(), transport.clone());
        let ids = seed_group(&store, &timeout_group(), 3).await;
        store.fail_retry_save_for(ids[0]);

        let batch = ForwardingBatchId::new();
        let expected = engine.stage_retry(batch, &ids, None).await.unwrap();
        assert_eq!(expected, 2);
        assert_eq!(status(&store, ids[0]).await, FailedMessageStatus::Unresolved);

        let summary = engine
            .start_retry_run(RetryRun::new(batch).with_expected_count(expected), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((summary.end, summary.forwarded), (RunEnd::Completed, 2));
    }

    #[tokio::test]
    async fn new_failure_reopens_an_archived_message() {
        let store = Arc::new(FlakyStore::new());
        let group = timeout_group();
        let ids = seed_group(&store, &group, 3).await;
        let engine = engine(store.clone(), bus(), Arc::new(InMemoryTransport::new()));

        engine.run_archive(group.id).await.unwrap();
        assert_eq!(status(&store, ids[0]).await, FailedMessageStatus::Archived);

        let message_id = format!("{}-0", group.title);
        let receipt = engine
            .capture()
            .record_failed_attempt(
                MessageContext::new("native-refail", Headers::new(), b"again".to_vec()),
                attempt(&message_id, "sales", 30),
                vec![group.clone()],
            )
            .await
            .unwrap();

        assert_eq!(receipt.unique_message_id, ids[0]);
        assert_eq!(receipt.number_of_attempts, 2);
        assert_eq!(status(&store, ids[0]).await, FailedMessageStatus::Unresolved);
        assert_eq!(store.load_body(ids[0]).await.unwrap(), Some(b"again".to_vec()));
        assert_eq!(store.group_member_count(group.id, FailedMessageStatus::Archived).await.unwrap(), 2);
    }
}
