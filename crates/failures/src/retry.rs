use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recoverability_core::{Entity, ForwardingBatchId, UniqueMessageId};

/// In-flight retry record for one failed message.
///
/// Exists from the moment a message is staged for retry until the retry is
/// confirmed (message resolved) or compensated (message reverted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBookkeeping {
    pub unique_message_id: UniqueMessageId,
    pub forwarding_batch_id: ForwardingBatchId,
    pub staged_at: DateTime<Utc>,
    /// Destination requested instead of the original failing endpoint.
    pub destination_override: Option<String>,
}

impl Entity for RetryBookkeeping {
    type Id = UniqueMessageId;

    fn id(&self) -> &Self::Id {
        &self.unique_message_id
    }
}
