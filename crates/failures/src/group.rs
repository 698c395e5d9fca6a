use serde::{Deserialize, Serialize};

use recoverability_core::GroupId;

/// Classification bucket a failed message belongs to.
///
/// Groups are computed by classification rules outside the engine (exception
/// type, failing endpoint, ...). Membership is not stored as an edge list: each
/// failed message carries the groups it was classified into and the store
/// derives group counts from its own index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureGroup {
    pub id: GroupId,
    /// Human-readable group name shown to operators.
    pub title: String,
    /// Name of the classifier that produced this group.
    pub classifier: String,
}

impl FailureGroup {
    /// Build a group for a classifier and the key it produced; the id is
    /// deterministic so every process classifies into the same group.
    pub fn classified(classifier: impl Into<String>, key: impl Into<String>) -> Self {
        let classifier = classifier.into();
        let key = key.into();
        Self {
            id: GroupId::for_classification(&classifier, &key),
            title: key,
            classifier,
        }
    }
}
