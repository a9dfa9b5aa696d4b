use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::{TargetId, TargetPurpose};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Changes to one target since the previous remote event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the backend sent no new token.
    pub resume_token: Vec<u8>,
    /// Whether the target is in sync with the backend as of this event.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// A change that only flips `current`, used when a target is synthesized
    /// as current without a watch message (e.g. after an unchanged resume).
    pub fn create_synthesized_target_change_for_current_change(
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added_documents.is_empty()
            && self.modified_documents.is_empty()
            && self.removed_documents.is_empty()
    }
}

/// Everything the watch stream produced up to a consistent global snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match, with the purpose of the
    /// re-listen that follows.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    /// Latest version of every changed document; deletes are `NoDocument`s.
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Documents that changed only because of limbo resolution targets.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    /// An event with no document changes that marks `target_id` current (or
    /// not current). Used by secondary clients and tests to drive views.
    pub fn create_synthesized_remote_event_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::create_synthesized_target_change_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::none(),
            target_changes,
            ..Self::default()
        }
    }
}
