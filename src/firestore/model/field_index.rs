use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn ascending(field_path: FieldPath) -> Self {
        Self {
            field_path,
            kind: IndexKind::Ascending,
        }
    }

    pub fn descending(field_path: FieldPath) -> Self {
        Self {
            field_path,
            kind: IndexKind::Descending,
        }
    }
}

/// A client side composite index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    /// Assigned when the index is configured; `0` until then.
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: 0,
            collection_group: collection_group.into(),
            segments,
        }
    }

    /// Two indexes with the same group and segments are the same index.
    pub fn same_definition(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}
