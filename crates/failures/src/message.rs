//! Failed message records and the attempt-history merge rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recoverability_core::{DomainError, DomainResult, Entity, UniqueMessageId};

use crate::group::FailureGroup;

/// Number of processing attempts retained per failed message.
pub const DEFAULT_MAX_PROCESSING_ATTEMPTS: usize = 10;

/// Current schema version of [`ProcessingAttempt`].
pub const PROCESSING_ATTEMPT_SCHEMA_VERSION: u32 = 1;

/// Remediation status of a failed message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedMessageStatus {
    Unresolved,
    Archived,
    RetryIssued,
    Resolved,
}

impl core::fmt::Display for FailedMessageStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            FailedMessageStatus::Unresolved => "unresolved",
            FailedMessageStatus::Archived => "archived",
            FailedMessageStatus::RetryIssued => "retry_issued",
            FailedMessageStatus::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

/// Exception captured when processing failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDetails {
    pub exception_type: String,
    pub message: String,
    pub source: Option<String>,
    pub stack_trace: Option<String>,
}

/// Where and when the failure happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub exception: ExceptionDetails,
    /// Queue address of the endpoint that failed to process the message.
    pub address_of_failing_endpoint: String,
    pub time_of_failure: DateTime<Utc>,
}

/// Closed set of message metadata the engine understands.
///
/// Backend- or transport-specific values that do not fit these fields go to
/// `extensions`, so the record stays strongly typed without losing data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub message_type: Option<String>,
    pub sending_endpoint: Option<String>,
    pub receiving_endpoint: Option<String>,
    pub conversation_id: Option<String>,
    pub content_type: Option<String>,
    pub time_sent: Option<DateTime<Utc>>,
    pub is_system_message: bool,
    pub body_size: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// One failed processing attempt of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingAttempt {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    /// Logical message id assigned by the sender.
    pub message_id: String,
    /// Native id of the transport message that carried this attempt.
    pub native_message_id: String,
    pub attempted_at: DateTime<Utc>,
    pub failure_details: FailureDetails,
    pub metadata: MessageMetadata,
    pub headers: BTreeMap<String, String>,
}

fn current_schema_version() -> u32 {
    PROCESSING_ATTEMPT_SCHEMA_VERSION
}

impl ProcessingAttempt {
    pub fn new(
        message_id: impl Into<String>,
        native_message_id: impl Into<String>,
        attempted_at: DateTime<Utc>,
        failure_details: FailureDetails,
    ) -> Self {
        Self {
            schema_version: PROCESSING_ATTEMPT_SCHEMA_VERSION,
            message_id: message_id.into(),
            native_message_id: native_message_id.into(),
            attempted_at,
            failure_details,
            metadata: MessageMetadata::default(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// What recording an attempt did to the record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The record did not exist and was created with this attempt.
    Created,
    /// A new attempt was appended (and the record re-opened).
    Appended,
    /// An attempt with the same `attempted_at` was already recorded.
    Duplicate,
    /// The attempt is older than the newest recorded one. It is kept in the
    /// history (unless bounding drops it) but status and groups stay as the
    /// newest attempt left them.
    Stale,
}

/// Durable record of a message that failed processing.
///
/// Invariants:
/// - `processing_attempts` is never empty
/// - attempts are unique by `attempted_at` and sorted ascending
/// - at most `max_attempts` (most recent) are retained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMessage {
    id: UniqueMessageId,
    status: FailedMessageStatus,
    processing_attempts: Vec<ProcessingAttempt>,
    failure_groups: Vec<FailureGroup>,
}

impl Entity for FailedMessage {
    type Id = UniqueMessageId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl FailedMessage {
    /// Create a record for a message's first failure.
    pub fn first_failure(
        id: UniqueMessageId,
        attempt: ProcessingAttempt,
        groups: Vec<FailureGroup>,
    ) -> Self {
        Self {
            id,
            status: FailedMessageStatus::Unresolved,
            processing_attempts: vec![attempt],
            failure_groups: dedupe_groups(groups),
        }
    }

    /// Pure merge used by capture: create the record or fold a new attempt
    /// into the previous version of it.
    pub fn merge_attempt(
        previous: Option<FailedMessage>,
        id: UniqueMessageId,
        attempt: ProcessingAttempt,
        groups: Vec<FailureGroup>,
        max_attempts: usize,
    ) -> (FailedMessage, AttemptOutcome) {
        match previous {
            None => (
                FailedMessage::first_failure(id, attempt, groups),
                AttemptOutcome::Created,
            ),
            Some(mut existing) => {
                let outcome = existing.record_attempt(attempt, groups, max_attempts);
                (existing, outcome)
            }
        }
    }

    /// Append a new attempt unless it is a duplicate delivery.
    ///
    /// A new attempt re-opens the record (`Unresolved`) regardless of its prior
    /// status and replaces its group classification with the latest one.
    /// Attempts older than the newest one only extend the history.
    pub fn record_attempt(
        &mut self,
        attempt: ProcessingAttempt,
        groups: Vec<FailureGroup>,
        max_attempts: usize,
    ) -> AttemptOutcome {
        if self.has_attempt(attempt.attempted_at) {
            return AttemptOutcome::Duplicate;
        }

        let stale = attempt.attempted_at < self.last_attempt().attempted_at;

        self.processing_attempts.push(attempt);
        self.processing_attempts.sort_by_key(|a| a.attempted_at);

        let max = max_attempts.max(1);
        if self.processing_attempts.len() > max {
            let excess = self.processing_attempts.len() - max;
            self.processing_attempts.drain(..excess);
        }

        if stale {
            return AttemptOutcome::Stale;
        }

        self.status = FailedMessageStatus::Unresolved;
        self.failure_groups = dedupe_groups(groups);

        AttemptOutcome::Appended
    }

    /// Whether an attempt made at `attempted_at` is in the retained history.
    pub fn has_attempt(&self, attempted_at: DateTime<Utc>) -> bool {
        self.processing_attempts.iter().any(|a| a.attempted_at == attempted_at)
    }

    pub fn status(&self) -> FailedMessageStatus {
        self.status
    }

    pub fn processing_attempts(&self) -> &[ProcessingAttempt] {
        &self.processing_attempts
    }

    pub fn failure_groups(&self) -> &[FailureGroup] {
        &self.failure_groups
    }

    pub fn belongs_to(&self, group: recoverability_core::GroupId) -> bool {
        self.failure_groups.iter().any(|g| g.id == group)
    }

    /// Most recent attempt (the record is never empty).
    pub fn last_attempt(&self) -> &ProcessingAttempt {
        // `processing_attempts` is non-empty by construction.
        &self.processing_attempts[self.processing_attempts.len() - 1]
    }

    /// Move to `to` if the record is currently in `from`.
    ///
    /// Returns `true` when the status changed; applying the same transition to
    /// a record already in `to` is a no-op.
    pub fn transition(&mut self, from: FailedMessageStatus, to: FailedMessageStatus) -> bool {
        if self.status == from && from != to {
            self.status = to;
            true
        } else {
            false
        }
    }

    /// Mark the record as successfully retried.
    pub fn resolve(&mut self) -> bool {
        if self.status == FailedMessageStatus::Resolved {
            return false;
        }
        self.status = FailedMessageStatus::Resolved;
        true
    }

    /// Stage the record for retry. Only unresolved messages can be retried.
    pub fn issue_retry(&mut self) -> DomainResult<()> {
        match self.status {
            FailedMessageStatus::Unresolved => {
                self.status = FailedMessageStatus::RetryIssued;
                Ok(())
            }
            FailedMessageStatus::RetryIssued => Ok(()),
            other => Err(DomainError::invariant(format!(
                "cannot retry a message in status {other}"
            ))),
        }
    }
}

fn dedupe_groups(groups: Vec<FailureGroup>) -> Vec<FailureGroup> {
    let mut seen = std::collections::HashSet::new();
    groups.into_iter().filter(|g| seen.insert(g.id)).collect()
}
