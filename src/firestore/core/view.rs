use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::local::{DocumentMap, QueryResult};
use crate::firestore::model::{DocumentComparator, DocumentKey, DocumentSet, MutableDocument};
use crate::firestore::remote::{OnlineState, TargetChange};

/// A document entering or leaving the set of keys this view cannot vouch for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// The result of `View::compute_doc_changes`, not yet applied to the view.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limit query dropped documents that may have to be replaced from the
    /// full local result set.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// The client side state of one query: which documents it shows, which of
/// them carry pending writes and which the backend has confirmed.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    has_cached_results: bool,
    /// Whether the backend reported the target as in sync.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend last reported for this target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            has_cached_results: false,
            current: false,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Works out how `changes` affect the view without modifying it. Pass the
    /// result of a previous call as `previous` to continue from it, e.g. when
    /// refilling a limit query from the full local result set.
    pub fn compute_doc_changes(
        &self,
        changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit.map(|limit| limit as usize);
        let last_doc_in_limit = match (self.query.limit_type, limit) {
            (LimitType::First, Some(limit)) if old_document_set.len() == limit => {
                old_document_set.last().cloned()
            }
            _ => None,
        };
        let first_doc_in_limit = match (self.query.limit_type, limit) {
            (LimitType::Last, Some(limit)) if old_document_set.len() == limit => {
                old_document_set.first().cloned()
            }
            _ => None,
        };

        for (key, entry) in changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations =
                old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_doc_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                doc: new_doc.clone(),
                            });
                            change_applied = true;

                            let past_last = last_doc_in_limit.as_ref().is_some_and(|last| {
                                (self.comparator)(new_doc, last) == Ordering::Greater
                            });
                            let before_first = first_doc_in_limit.as_ref().is_some_and(|first| {
                                (self.comparator)(new_doc, first) == Ordering::Less
                            });
                            if past_last || before_first {
                                // The document moved out of the window; whatever
                                // follows it locally may belong in the view now.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            doc: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        doc: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        doc: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.add(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    doc: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Applies computed changes and, when something a listener can observe
    /// changed, produces the next snapshot. `target_is_pending_reset` holds
    /// back limbo bookkeeping while an existence filter mismatch is resolved.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.get_changes();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| (self.comparator)(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);
        if let Some(change) = target_change {
            self.has_cached_results = !change.resume_token.is_empty();
        }

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: self.document_set.clone(),
                old_docs,
                doc_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
                has_cached_results: self.has_cached_results,
            }),
            limbo_changes,
        }
    }

    /// Going offline means the view can no longer claim to be current, which
    /// listeners observe as a switch to from-cache results.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    /// Replaces the view's contents with what another client persisted. Used
    /// when this client becomes primary and its views may be stale.
    pub fn synchronize_with_persisted_state(&mut self, query_result: QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys;
        self.limbo_documents = BTreeSet::new();
        let doc_changes = self.compute_doc_changes(&query_result.documents, None);
        self.apply_changes(doc_changes, true, None, false)
    }

    /// Snapshot for a listener that attaches to an already running view.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            self.has_cached_results,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("modified document {key} was not part of the synced set");
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // Until the target is current the synced set may simply be incomplete.
        if !self.current {
            return Vec::new();
        }

        let old_limbo_documents = std::mem::take(&mut self.limbo_documents);
        let new_limbo_documents: BTreeSet<DocumentKey> = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo_documents
            .difference(&new_limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            new_limbo_documents
                .difference(&old_limbo_documents)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        self.limbo_documents = new_limbo_documents;
        changes
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes are expected to be missing from the backend's view.
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }
}

/// An acknowledged write whose result has not arrived on the watch stream
/// yet would show the pre-write data; keep the optimistic version instead.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}
