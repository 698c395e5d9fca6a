//! Logical header names understood by the engine.
//!
//! How these are encoded on the wire is up to the transport.

use std::collections::BTreeMap;

/// Transport-level headers carried with every message.
pub type Headers = BTreeMap<String, String>;

/// Logical message id assigned by the sender.
pub const MESSAGE_ID: &str = "MessageId";
/// Queue the message failed in (set by the failing endpoint).
pub const FAILED_QUEUE: &str = "FailedQ";
/// Logical endpoint that was processing the message.
pub const PROCESSING_ENDPOINT: &str = "ProcessingEndpoint";
/// Envelope format marker; forwarded untouched so older consumers can still
/// deserialize the message.
pub const ENVELOPE_FORMAT: &str = "EnvelopeFormat";

/// Retry run the staged message belongs to.
pub const STAGING_ID: &str = "Recoverability.StagingId";
/// Failed message the staged copy was produced from.
pub const UNIQUE_MESSAGE_ID: &str = "Recoverability.UniqueMessageId";
/// Native id of the processing attempt whose body is being retried.
pub const ATTEMPT_ID: &str = "Recoverability.AttemptId";
/// Original destination of the staged message.
pub const TARGET_ENDPOINT: &str = "Recoverability.TargetEndpoint";
/// Operator-requested destination overriding [`TARGET_ENDPOINT`].
pub const RETRY_TO: &str = "Recoverability.RetryTo";
/// Present when the body was left in the store instead of the envelope.
pub const BODY_NOT_CARRIED: &str = "Recoverability.BodyNotCarried";

/// Stamped on redelivered messages so a successful retry can be confirmed.
pub const RETRY_OF: &str = "Recoverability.RetryOf";

/// Bookkeeping headers that must not leak to the destination endpoint.
pub const STAGING_HEADERS: [&str; 6] = [
    STAGING_ID,
    UNIQUE_MESSAGE_ID,
    ATTEMPT_ID,
    TARGET_ENDPOINT,
    RETRY_TO,
    BODY_NOT_CARRIED,
];

/// Remove every staging bookkeeping header in place.
pub fn strip_staging_headers(headers: &mut Headers) {
    for name in STAGING_HEADERS {
        headers.remove(name);
    }
}

/// First non-blank value among `names`.
pub fn first_present<'a>(headers: &'a Headers, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|n| headers.get(*n))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}
