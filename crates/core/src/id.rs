//! Strongly-typed identifiers used across the engine.
//!
//! Failure records and groups use **name-based** (UUIDv5) identifiers so the
//! same logical message or classification always maps to the same id, across
//! retries and across processes. Forwarding batches are time-ordered (UUIDv7).

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

const UNIQUE_MESSAGE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_4a7e_2d35_4b8e_9c61_0a3f_5e2b_7d14);
const FAILURE_GROUP_NAMESPACE: Uuid = Uuid::from_u128(0x0b9e_52c8_71fa_4d03_a6e4_3c8d_19f0_62ab);

/// Stable identity of a failed message: hash of message id + originating endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueMessageId(Uuid);

/// Identity of a failure group (classification rule + key).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Uuid);

/// Identity of one retry run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForwardingBatchId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(UniqueMessageId, "UniqueMessageId");
impl_uuid_newtype!(GroupId, "GroupId");
impl_uuid_newtype!(ForwardingBatchId, "ForwardingBatchId");

impl UniqueMessageId {
    /// Derive the identity from the transport message id and the endpoint that
    /// failed to process it.
    ///
    /// The same pair always yields the same id, so a message that fails again
    /// after a retry lands on its existing record.
    pub fn from_parts(message_id: &str, endpoint: &str) -> Self {
        let name = format!("{message_id}@{endpoint}");
        Self(Uuid::new_v5(&UNIQUE_MESSAGE_NAMESPACE, name.as_bytes()))
    }
}

impl GroupId {
    /// Derive a group id from a classifier name and the key it produced
    /// (e.g. `"Exception Type and Stack Trace"`, `"System.TimeoutException"`).
    pub fn for_classification(classifier: &str, key: &str) -> Self {
        let name = format!("{classifier}/{key}");
        Self(Uuid::new_v5(&FAILURE_GROUP_NAMESPACE, name.as_bytes()))
    }
}

impl ForwardingBatchId {
    /// Create a new, time-ordered retry run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ForwardingBatchId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_message_id_is_stable_for_same_parts() {
        let a = UniqueMessageId::from_parts("msg-1", "Sales");
        let b = UniqueMessageId::from_parts("msg-1", "Sales");
        assert_eq!(a, b);
    }

    #[test]
    fn unique_message_id_differs_per_endpoint() {
        let a = UniqueMessageId::from_parts("msg-1", "Sales");
        let b = UniqueMessageId::from_parts("msg-1", "Billing");
        assert_ne!(a, b);
    }

    #[test]
    fn group_id_is_deterministic() {
        let a = GroupId::for_classification("Exception Type", "TimeoutException");
        let b = GroupId::for_classification("Exception Type", "TimeoutException");
        let c = GroupId::for_classification("Endpoint Address", "TimeoutException");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let id = UniqueMessageId::from_parts("m", "e");
        let parsed: UniqueMessageId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);

        let err = "not-a-uuid".parse::<GroupId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(msg) if msg.starts_with("GroupId")));
    }
}
