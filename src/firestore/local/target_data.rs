use serde::{Deserialize, Serialize};

use crate::firestore::core::Target;
use crate::firestore::model::SnapshotVersion;

pub type TargetId = i32;
pub type ListenSequenceNumber = i64;

/// Sequence number used by targets that are never persisted.
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPurpose {
    /// A regular query listen.
    Listen,
    /// Re-listen after an existence filter mismatch.
    ExistenceFilterMismatch,
    /// Re-listen after a mismatch that the bloom filter could not resolve.
    ExistenceFilterMismatchBloom,
    /// A single document listen used to resolve a limbo document.
    LimboResolution,
}

/// Everything the client knows about a listened target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version at which the stored resume token was received.
    pub snapshot_version: SnapshotVersion,
    /// Latest version at which the target was in sync with no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque backend token used to resume the listen. Empty when unknown.
    pub resume_token: Vec<u8>,
    /// Number of documents the client believes match, sent on resume.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::none(),
            last_limbo_free_snapshot_version: SnapshotVersion::none(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// Replaces the resume token. The expected count is tied to the old token and is cleared.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
