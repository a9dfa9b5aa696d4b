use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::{TargetData, TargetId, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentChange, ExistenceFilter, TargetChangeState, WatchTargetChange,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local cache currently associates with `target_id`.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Data of an active target, `None` once the target is no longer listened to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

#[derive(Debug)]
struct TargetState {
    /// Listen/unlisten requests the backend has not answered yet. Changes for
    /// a target with pending responses are ignored.
    pending_responses: u32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // A fresh target always raises an initial change.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let keys = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            keys.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses = self.pending_responses.saturating_sub(1);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes until the backend reports a consistent global
/// snapshot, then turns them into a single `RemoteEvent`.
#[derive(Debug)]
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Targets each pending document was seen in, used to detect documents
    /// only limbo resolutions care about.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: &DocumentChange, metadata: &dyn TargetMetadataProvider) {
        let found = change
            .document
            .as_ref()
            .filter(|document| document.is_found_document());
        for target_id in &change.updated_target_ids {
            match found {
                Some(document) => self.add_document_to_target(*target_id, document.clone(), metadata),
                None => self.remove_document_from_target(
                    *target_id,
                    &change.key,
                    change.document.clone(),
                    metadata,
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.document.clone(), metadata);
        }
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange, metadata: &dyn TargetMetadataProvider) {
        for target_id in self.affected_targets(change, metadata) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    // The backend acknowledged the listen; changes from now on apply.
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        // All documents will be resent; forget what we have seen.
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the backend's document count with the local one. A mismatch
    /// the bloom filter cannot explain resets the target.
    pub fn handle_existence_filter(&mut self, filter: &ExistenceFilter, metadata: &dyn TargetMetadataProvider) {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        if target_data.target.is_document_query() {
            if filter.count == 0 {
                // The single document is gone. Its deletion has no version.
                let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) else {
                    return;
                };
                let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::none());
                self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
            } else if filter.count != 1 {
                log::warn!(
                    "single document existence filter for target {target_id} reported {} documents",
                    filter.count
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        if current_count == i64::from(filter.count) {
            return;
        }
        let application = self.apply_bloom_filter(filter, current_count, metadata);
        if application != BloomFilterApplication::Success {
            log::debug!(
                "existence filter mismatch for target {target_id}: expected {}, have {current_count}",
                filter.count
            );
            self.reset_target(target_id, metadata);
            let purpose = if application == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    /// Records an outstanding listen or unlisten for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    /// Collects all accumulated changes into one event at `snapshot_version`
    /// and starts over.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if current && target_data.target.is_document_query() {
                // A current document target that never saw its document means the
                // document does not exist. Synthesize the delete so limbo
                // resolution can finish.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let seen = self
                        .pending_document_target_mapping
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !seen && !self.target_contains_document(target_id, &key, metadata) {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, metadata)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Forgets the state of `target_id`, e.g. after the stream reconnects.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn affected_targets(&self, change: &WatchTargetChange, metadata: &dyn TargetMetadataProvider) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, metadata))
            .collect()
    }

    fn apply_bloom_filter(
        &mut self,
        filter: &ExistenceFilter,
        current_count: i64,
        metadata: &dyn TargetMetadataProvider,
    ) -> BloomFilterApplication {
        let Some(spec) = &filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let bloom_filter = match BloomFilter::from_spec(spec) {
            Ok(bloom_filter) => bloom_filter,
            Err(err) => {
                log::warn!("applying bloom filter failed: {err}");
                return BloomFilterApplication::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }
        let removed = self.filter_removed_documents(&bloom_filter, filter.target_id, metadata);
        if i64::from(filter.count) != current_count - removed {
            BloomFilterApplication::FalsePositive
        } else {
            BloomFilterApplication::Success
        }
    }

    /// Removes cached documents of the target the backend no longer has and
    /// returns how many were removed.
    fn filter_removed_documents(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> i64 {
        let mut removed = 0;
        for key in metadata.get_remote_keys_for_target(target_id) {
            let path = self.database_id.document_path(&key);
            if !bloom_filter.might_contain(&path) {
                self.remove_document_from_target(target_id, &key, None, metadata);
                removed += 1;
            }
        }
        removed
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        metadata.get_remote_keys_for_target(target_id).len() as i64
            + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MutableDocument,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left before a snapshot was raised.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    /// Drops accumulated changes for the target and schedules removals of
    /// every document it currently holds. Documents the backend resends
    /// before the next snapshot cancel their removal.
    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::new());
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        let active = self.target_data_for_active_target(target_id, metadata).is_some();
        if !active {
            log::debug!("detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        if self
            .target_states
            .get(&target_id)
            .is_some_and(TargetState::is_pending)
        {
            return None;
        }
        metadata.get_target_data_for_target(target_id)
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.get_remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, Target};
    use crate::firestore::model::{FieldPath, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};

    #[derive(Default)]
    struct Metadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl Metadata {
        fn with_query_target(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            let target = Query::collection(ResourcePath::from_string("rooms").unwrap()).to_target();
            self.targets
                .insert(target_id, TargetData::new(target, target_id, TargetPurpose::Listen, 1));
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, path: &str) -> Self {
            let target = Target::for_document(&key(path));
            self.targets.insert(
                target_id,
                TargetData::new(target, target_id, TargetPurpose::LimboResolution, 1),
            );
            self
        }
    }

    impl TargetMetadataProvider for Metadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("v").unwrap(), FirestoreValue::from_integer(version));
        MutableDocument::new_found(key(path), SnapshotVersion::from_micros(version), data)
    }

    fn update(target_id: TargetId, document: MutableDocument) -> DocumentChange {
        DocumentChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            key: document.key().clone(),
            document: Some(document),
        }
    }

    #[test]
    fn accumulates_changes_until_snapshot() {
        let metadata = Metadata::default().with_query_target(2, &["rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default_database("p"));
        aggregator.handle_document_change(&update(2, doc("rooms/a", 3)), &metadata);
        aggregator.handle_document_change(&update(2, doc("rooms/b", 3)), &metadata);
        aggregator.handle_target_change(
            &WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(b"t".to_vec()),
            &metadata,
        );

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(3), &metadata);
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, b"t".to_vec());
        assert_eq!(change.added_documents, BTreeSet::from([key("rooms/a")]));
        assert_eq!(change.modified_documents, BTreeSet::from([key("rooms/b")]));
        assert_eq!(event.document_updates.len(), 2);
        assert_eq!(
            event.document_updates[&key("rooms/a")].read_time(),
            SnapshotVersion::from_micros(3)
        );

        let next = aggregator.create_remote_event(SnapshotVersion::from_micros(4), &metadata);
        assert!(next.target_changes.is_empty());
        assert!(next.document_updates.is_empty());
    }

    #[test]
    fn pending_targets_ignore_changes() {
        let metadata = Metadata::default().with_query_target(2, &[]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default_database("p"));
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(&update(2, doc("rooms/a", 1)), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(1), &metadata);
        assert!(event.document_updates.is_empty());

        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Added, vec![2]), &metadata);
        aggregator.handle_document_change(&update(2, doc("rooms/a", 2)), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(2), &metadata);
        assert_eq!(event.document_updates.len(), 1);
    }

    #[test]
    fn existence_filter_mismatch_resets_target() {
        let metadata = Metadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default_database("p"));
        aggregator.handle_existence_filter(&ExistenceFilter::new(2, 1), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        assert_eq!(
            event.target_changes[&2].removed_documents,
            BTreeSet::from([key("rooms/a"), key("rooms/b")])
        );
    }

    #[test]
    fn bloom_filter_removes_deleted_documents() {
        let database_id = DatabaseId::default_database("p");
        let metadata = Metadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let kept = database_id.document_path(&key("rooms/a"));
        let filter = BloomFilter::build([kept.as_str()], 1_000, 7);
        let mut aggregator = WatchChangeAggregator::new(database_id);
        aggregator.handle_existence_filter(
            &ExistenceFilter::new(2, 1).with_bloom_filter(filter.to_spec()),
            &metadata,
        );
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5), &metadata);
        assert!(event.target_mismatches.is_empty());
        assert_eq!(
            event.target_changes[&2].removed_documents,
            BTreeSet::from([key("rooms/b")])
        );
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_delete() {
        let metadata = Metadata::default().with_limbo_target(1, "rooms/a");
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default_database("p"));
        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Current, vec![1]), &metadata);
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(9), &metadata);
        let document = &event.document_updates[&key("rooms/a")];
        assert!(document.is_no_document());
        assert_eq!(document.version(), SnapshotVersion::from_micros(9));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/a")));
    }
}
