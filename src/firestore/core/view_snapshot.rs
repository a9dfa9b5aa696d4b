use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::model::{DocumentKey, DocumentSet, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the document's metadata (pending writes) changed.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: MutableDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// Accumulates per-document changes, folding repeated changes to the same key
/// into the single change a listener should observe.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                doc: change.doc,
            }),
            (Modified, Modified) => Some(DocumentViewChange {
                change_type: Modified,
                doc: change.doc,
            }),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                doc: change.doc,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                doc: old.doc.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                doc: change.doc,
            }),
            (old_type, new_type) => {
                log::warn!("unsupported view change combination for {key}: {old_type:?} then {new_type:?}");
                return;
            }
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn get_changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// What a query listener sees: the query's documents at one point in time and
/// how they differ from the previous snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// The first snapshot of a listener that joins an existing query: every
    /// document shows up as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange {
                change_type: ChangeType::Added,
                doc: doc.clone(),
            })
            .collect();
        let old_docs = DocumentSet::new(documents.comparator());
        Self {
            query,
            docs: documents,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            MapValue::empty(),
        )
    }

    fn change(change_type: ChangeType, doc: MutableDocument) -> DocumentViewChange {
        DocumentViewChange { change_type, doc }
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("rooms/a", 1)));
        set.track(change(ChangeType::Removed, doc("rooms/a", 1)));
        assert!(set.is_empty());
    }

    #[test]
    fn added_then_modified_stays_added_with_latest_doc() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("rooms/a", 1)));
        set.track(change(ChangeType::Modified, doc("rooms/a", 2)));
        assert_eq!(set.get_changes(), vec![change(ChangeType::Added, doc("rooms/a", 2))]);
    }

    #[test]
    fn removed_then_added_becomes_modified() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, doc("rooms/a", 1)));
        set.track(change(ChangeType::Added, doc("rooms/a", 2)));
        assert_eq!(set.get_changes(), vec![change(ChangeType::Modified, doc("rooms/a", 2))]);
    }

    #[test]
    fn modified_then_removed_keeps_the_old_document() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Modified, doc("rooms/a", 1)));
        set.track(change(ChangeType::Removed, doc("rooms/a", 2)));
        assert_eq!(set.get_changes(), vec![change(ChangeType::Removed, doc("rooms/a", 1))]);
    }

    #[test]
    fn metadata_is_upgraded_by_real_changes() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Metadata, doc("rooms/a", 1)));
        set.track(change(ChangeType::Modified, doc("rooms/a", 2)));
        assert_eq!(set.get_changes(), vec![change(ChangeType::Modified, doc("rooms/a", 2))]);
    }

    #[test]
    fn initial_snapshot_reports_every_document_as_added() {
        let mut docs = DocumentSet::key_ordered();
        docs.add(doc("rooms/a", 1));
        docs.add(doc("rooms/b", 1));
        let query = Query::collection(crate::firestore::model::ResourcePath::from_string("rooms").unwrap());
        let snapshot = ViewSnapshot::from_initial_documents(query, docs, BTreeSet::new(), true, false);
        assert_eq!(snapshot.doc_changes.len(), 2);
        assert!(snapshot.doc_changes.iter().all(|c| c.change_type == ChangeType::Added));
        assert!(snapshot.sync_state_changed);
        assert!(!snapshot.has_pending_writes());
    }
}
