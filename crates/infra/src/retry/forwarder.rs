//! Retry forwarder: redelivers staged messages to their destination.
//!
//! The forwarder is long-lived. [`RetryForwarder::start`] opens the staging
//! queue once; each [`RetryForwarder::run`] then consumes it for one retry run
//! and leaves the receiver open for the next one.
//!
//! A run ends when:
//! - the expected number of messages was handled (counting mode), or
//! - nothing arrived for the idle timeout (timeout mode, count unknown), or
//! - the caller cancelled it.
//!
//! Handlers never stop the receiver themselves. The run loop owns the
//! receiver: it filters staged messages by run, stops pulling once the
//! expected count was accepted (or the countdown/cancellation fires) and then
//! waits for in-flight handlers to drain.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use recoverability_core::{ForwardingBatchId, UniqueMessageId};
use recoverability_events::EventBus;
use recoverability_failures::{MessageRetryFailed, RecoverabilityEvent};

use super::countdown::IdleCountdown;
use super::transport::{MessageTransport, QueueReceiver, TransportError, TransportMessage};
use crate::capture::FailureCapture;
use crate::headers;
use crate::publisher::{RecoverabilityEnvelope, publish};
use crate::settings::RecoverabilitySettings;
use crate::store::FailureRecordStore;

/// Extra filter over staged messages of a run.
pub type RunPredicate = Arc<dyn Fn(&TransportMessage) -> bool + Send + Sync>;

/// One retry run: which staged messages to forward and when to stop.
#[derive(Clone)]
pub struct RetryRun {
    pub forwarding_batch_id: ForwardingBatchId,
    pub expected_count: Option<usize>,
    predicate: Option<RunPredicate>,
}

impl core::fmt::Debug for RetryRun {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryRun")
            .field("forwarding_batch_id", &self.forwarding_batch_id)
            .field("expected_count", &self.expected_count)
            .field("filtered", &self.predicate.is_some())
            .finish()
    }
}

impl RetryRun {
    pub fn new(forwarding_batch_id: ForwardingBatchId) -> Self {
        Self {
            forwarding_batch_id,
            expected_count: None,
            predicate: None,
        }
    }

    pub fn with_expected_count(mut self, expected: usize) -> Self {
        self.expected_count = Some(expected);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TransportMessage) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether a staged message belongs to this run.
    pub fn matches(&self, message: &TransportMessage) -> bool {
        let staged_for = message
            .header(headers::STAGING_ID)
            .and_then(|v| v.parse::<ForwardingBatchId>().ok());
        staged_for == Some(self.forwarding_batch_id) && self.predicate.as_ref().is_none_or(|p| p(message))
    }
}

/// Why a run stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunEnd {
    /// Expected count reached or idle timeout elapsed.
    Completed,
    /// Cancelled by the caller.
    Cancelled,
    /// The staging queue was closed underneath the run.
    ReceiverClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub forwarding_batch_id: ForwardingBatchId,
    pub end: RunEnd,
    pub forwarded: usize,
    pub failed: usize,
    /// Messages dropped because they belong to another run.
    pub skipped: usize,
}

impl RunSummary {
    pub fn ended_prematurely(&self) -> bool {
        self.end != RunEnd::Completed
    }
}

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("retry forwarder is not started")]
    NotStarted,

    #[error("a retry run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Disposition {
    Forwarded,
    Failed,
    Skipped,
}

/// Shared bookkeeping of one run, updated from concurrent handlers.
#[derive(Debug)]
struct RunProgress {
    forwarded: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    /// Armed only when the expected count is unknown.
    countdown: Option<IdleCountdown>,
}

impl RunProgress {
    fn new(expected: Option<usize>, idle_timeout: Duration) -> Self {
        Self {
            forwarded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            countdown: expected.is_none().then(|| IdleCountdown::start(idle_timeout)),
        }
    }

    /// Count a handled message. Failed deliveries count like forwarded ones
    /// so a failing message cannot hold a run open.
    fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Skipped => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Disposition::Forwarded => &self.forwarded,
            Disposition::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        if let Some(countdown) = &self.countdown {
            countdown.reset();
        }
    }

    async fn idle_expired(&self) {
        match &self.countdown {
            Some(countdown) => countdown.expired().await,
            None => std::future::pending().await,
        }
    }

    fn summary(&self, forwarding_batch_id: ForwardingBatchId, end: RunEnd) -> RunSummary {
        RunSummary {
            forwarding_batch_id,
            end,
            forwarded: self.forwarded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }
}

enum ReceiverState {
    Stopped,
    Idle(Box<dyn QueueReceiver>),
    Running,
}

/// Receiver on loan to a run. Hands it back (or marks the forwarder stopped
/// once it was closed) when dropped, including when the run future is
/// dropped mid-way.
struct ReceiverLease<'a> {
    state: &'a Mutex<ReceiverState>,
    receiver: Option<Box<dyn QueueReceiver>>,
}

impl ReceiverLease<'_> {
    async fn receive(&mut self) -> Option<TransportMessage> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.receive().await,
            None => None,
        }
    }

    async fn close(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close().await;
        }
    }
}

impl Drop for ReceiverLease<'_> {
    fn drop(&mut self) {
        let returned = match self.receiver.take() {
            Some(receiver) => ReceiverState::Idle(receiver),
            None => ReceiverState::Stopped,
        };
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = returned;
    }
}

struct ForwarderContext<S, B, T> {
    capture: Arc<FailureCapture<S, B>>,
    transport: T,
}

pub struct RetryForwarder<S, B, T> {
    ctx: Arc<ForwarderContext<S, B, T>>,
    staging_queue: String,
    concurrency: usize,
    idle_timeout: Duration,
    /// Serializes `start` and `stop`; runs only touch `state`.
    lifecycle: AsyncMutex<()>,
    state: Mutex<ReceiverState>,
}

impl<S, B, T> RetryForwarder<S, B, T>
where
    S: FailureRecordStore + 'static,
    B: EventBus<RecoverabilityEnvelope> + 'static,
    T: MessageTransport + 'static,
{
    pub fn new(capture: Arc<FailureCapture<S, B>>, transport: T, settings: &RecoverabilitySettings) -> Self {
        Self {
            ctx: Arc::new(ForwarderContext { capture, transport }),
            staging_queue: settings.staging_queue.clone(),
            concurrency: settings.retry_concurrency.max(1),
            idle_timeout: settings.retry_idle_timeout,
            lifecycle: AsyncMutex::new(()),
            state: Mutex::new(ReceiverState::Stopped),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReceiverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the staging queue and open its receiver. Idempotent.
    pub async fn start(&self) -> Result<(), ForwarderError> {
        let _lifecycle = self.lifecycle.lock().await;
        let stopped = matches!(*self.state(), ReceiverState::Stopped);
        if !stopped {
            return Ok(());
        }

        let address = self.ctx.transport.resolve_address(&self.staging_queue)?;
        let receiver = self.ctx.transport.open_receiver(&address).await?;
        info!(queue = %self.staging_queue, address = %address, "retry forwarder started");

        *self.state() = ReceiverState::Idle(receiver);
        Ok(())
    }

    /// Close the receiver. Fails while a run is in progress.
    pub async fn stop(&self) -> Result<(), ForwarderError> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut receiver = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, ReceiverState::Stopped) {
                ReceiverState::Idle(receiver) => receiver,
                ReceiverState::Stopped => return Ok(()),
                ReceiverState::Running => {
                    *state = ReceiverState::Running;
                    return Err(ForwarderError::AlreadyRunning);
                }
            }
        };

        receiver.close().await;
        info!(queue = %self.staging_queue, "retry forwarder stopped");
        Ok(())
    }

    /// Forward staged messages of `run` until it completes or `cancel` fires.
    ///
    /// Messages staged for other runs are consumed and dropped. Dropping the
    /// returned future returns the receiver, so the next run can proceed.
    pub async fn run(&self, run: RetryRun, cancel: CancellationToken) -> Result<RunSummary, ForwarderError> {
        let receiver = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, ReceiverState::Running) {
                ReceiverState::Idle(receiver) => receiver,
                ReceiverState::Stopped => {
                    *state = ReceiverState::Stopped;
                    return Err(ForwarderError::NotStarted);
                }
                ReceiverState::Running => return Err(ForwarderError::AlreadyRunning),
            }
        };
        let mut lease = ReceiverLease {
            state: &self.state,
            receiver: Some(receiver),
        };

        let batch_id = run.forwarding_batch_id;
        info!(
            forwarding_batch_id = %batch_id,
            expected = ?run.expected_count,
            "retry run started"
        );

        let summary = self.pump(&mut lease, run, cancel).await;
        if summary.end == RunEnd::ReceiverClosed {
            lease.close().await;
        }
        drop(lease);

        info!(
            forwarding_batch_id = %batch_id,
            end = ?summary.end,
            forwarded = summary.forwarded,
            failed = summary.failed,
            skipped = summary.skipped,
            "retry run finished"
        );
        Ok(summary)
    }

    async fn pump(&self, receiver: &mut ReceiverLease<'_>, run: RetryRun, cancel: CancellationToken) -> RunSummary {
        let batch_id = run.forwarding_batch_id;
        let run = Arc::new(run);
        let progress = Arc::new(RunProgress::new(run.expected_count, self.idle_timeout));
        if let Some(countdown) = &progress.countdown {
            debug!(forwarding_batch_id = %batch_id, idle_timeout = ?countdown.timeout(), "no expected count, run ends after silence");
        }
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        let mut accepted = 0usize;

        let end = loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_handler_exit(joined);
            }

            if cancel.is_cancelled() {
                break RunEnd::Cancelled;
            }
            if run.expected_count.is_some_and(|expected| accepted >= expected) {
                break RunEnd::Completed;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break RunEnd::Cancelled,
                _ = progress.idle_expired() => break RunEnd::Completed,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break RunEnd::Completed,
                },
            };

            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break RunEnd::Cancelled,
                _ = progress.idle_expired() => break RunEnd::Completed,
                received = receiver.receive() => match received {
                    Some(message) => message,
                    None => break RunEnd::ReceiverClosed,
                },
            };

            if !run.matches(&message) {
                warn!(
                    native_message_id = %message.native_message_id,
                    staging_id = ?message.header(headers::STAGING_ID),
                    forwarding_batch_id = %batch_id,
                    "staged message does not belong to the active retry run, dropping it"
                );
                progress.record(Disposition::Skipped);
                continue;
            }
            accepted += 1;

            let ctx = self.ctx.clone();
            let run = run.clone();
            let progress = progress.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let disposition = forward_one(&ctx, &run, message).await;
                progress.record(disposition);
            });
        };

        if !in_flight.is_empty() {
            debug!(forwarding_batch_id = %batch_id, in_flight = in_flight.len(), "waiting for in-flight messages");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_handler_exit(joined);
        }

        progress.summary(batch_id, end)
    }
}

fn log_handler_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "retry handler panicked");
    }
}

async fn forward_one<S, B, T>(ctx: &ForwarderContext<S, B, T>, run: &RetryRun, message: TransportMessage) -> Disposition
where
    S: FailureRecordStore,
    B: EventBus<RecoverabilityEnvelope>,
    T: MessageTransport,
{
    let unique_id = message
        .header(headers::UNIQUE_MESSAGE_ID)
        .and_then(|v| v.parse::<UniqueMessageId>().ok());
    let attempt_id = message.header(headers::ATTEMPT_ID).map(str::to_string);
    let destination = message
        .header(headers::RETRY_TO)
        .or_else(|| message.header(headers::TARGET_ENDPOINT))
        .map(str::to_string);
    let body_not_carried = message.headers.contains_key(headers::BODY_NOT_CARRIED);

    let mut outgoing = message;
    headers::strip_staging_headers(&mut outgoing.headers);

    if body_not_carried {
        outgoing.body = load_body(ctx, unique_id, attempt_id.as_deref()).await;
    }

    let Some(destination) = destination else {
        compensate(ctx, run, unique_id, anyhow::anyhow!("staged message has no destination")).await;
        return Disposition::Failed;
    };

    if let Some(id) = unique_id {
        outgoing.headers.insert(headers::RETRY_OF.to_string(), id.to_string());
    }

    match ctx.transport.dispatch(outgoing, &destination).await {
        Ok(()) => {
            debug!(unique_message_id = ?unique_id, destination = %destination, "message forwarded");
            Disposition::Forwarded
        }
        Err(reason) => {
            compensate(ctx, run, unique_id, reason).await;
            Disposition::Failed
        }
    }
}

/// Body from the store; an empty body when it cannot be found.
async fn load_body<S, B, T>(
    ctx: &ForwarderContext<S, B, T>,
    unique_id: Option<UniqueMessageId>,
    attempt_id: Option<&str>,
) -> Vec<u8>
where
    S: FailureRecordStore,
    B: EventBus<RecoverabilityEnvelope>,
{
    let Some(id) = unique_id else {
        warn!(attempt_id = ?attempt_id, "staged message has no unique id, forwarding without body");
        return Vec::new();
    };

    match ctx.capture.store().load_body(id).await {
        Ok(Some(body)) => body,
        Ok(None) => {
            warn!(unique_message_id = %id, attempt_id = ?attempt_id, "message body not found, forwarding without body");
            Vec::new()
        }
        Err(e) => {
            warn!(unique_message_id = %id, error = %e, "could not load message body, forwarding without body");
            Vec::new()
        }
    }
}

/// Put the message back to `Unresolved` and report the failed retry.
async fn compensate<S, B, T>(
    ctx: &ForwarderContext<S, B, T>,
    run: &RetryRun,
    unique_id: Option<UniqueMessageId>,
    reason: anyhow::Error,
) where
    S: FailureRecordStore,
    B: EventBus<RecoverabilityEnvelope>,
{
    let reason = format!("{reason:#}");
    let Some(id) = unique_id else {
        error!(forwarding_batch_id = %run.forwarding_batch_id, reason = %reason, "retry failed for a message without unique id");
        return;
    };

    warn!(unique_message_id = %id, forwarding_batch_id = %run.forwarding_batch_id, reason = %reason, "retry delivery failed");

    if let Err(e) = ctx.capture.revert_to_unresolved(id).await {
        error!(unique_message_id = %id, error = %e, "could not revert failed retry, message stays retry-issued");
    }

    publish(
        ctx.capture.bus(),
        RecoverabilityEvent::MessageRetryFailed(MessageRetryFailed {
            unique_message_id: id,
            forwarding_batch_id: Some(run.forwarding_batch_id),
            reason,
            occurred_at: Utc::now(),
        }),
    );
}
