use crate::firestore::error::FirestoreError;
use crate::firestore::local::TargetId;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilterSpec;

/// One message of the watch stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchChange {
    Document(DocumentChange),
    Target(WatchTargetChange),
    ExistenceFilter(ExistenceFilter),
}

/// A document entered, changed in, or left some targets.
///
/// `document` is a found document for updates, a `NoDocument` for deletes, and
/// `None` when the document merely stopped matching the removed targets.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub document: Option<MutableDocument>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// State change of the listed targets, or of every active target when
/// `target_ids` is empty.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    /// Global snapshot version when `state` is `NoChange` and `target_ids` is empty.
    pub read_time: SnapshotVersion,
    /// Why the backend removed the targets.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: SnapshotVersion::none(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }

    /// A `NoChange` for every target carrying a new global snapshot version.
    pub fn global_snapshot(read_time: SnapshotVersion, resume_token: Vec<u8>) -> Self {
        Self::new(TargetChangeState::NoChange, Vec::new())
            .with_read_time(read_time)
            .with_resume_token(resume_token)
    }

    /// Whether this message ends a consistent snapshot of all targets.
    pub fn is_global_snapshot(&self) -> bool {
        self.state == TargetChangeState::NoChange && self.target_ids.is_empty()
    }
}

/// The number of documents the backend holds for a target, optionally with a
/// bloom filter of their paths.
#[derive(Clone, Debug, PartialEq)]
pub struct ExistenceFilter {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterSpec>,
}

impl ExistenceFilter {
    pub fn new(target_id: TargetId, count: i32) -> Self {
        Self {
            target_id,
            count,
            unchanged_names: None,
        }
    }

    pub fn with_bloom_filter(mut self, unchanged_names: BloomFilterSpec) -> Self {
        self.unchanged_names = Some(unchanged_names);
        self
    }
}
