use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::{Target, TargetIdGenerator};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::target_data::{ListenSequenceNumber, TargetData, TargetId};
use crate::firestore::model::{DocumentKey, SnapshotVersion};

/// Persisted targets, the documents each one matches, and global metadata.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TargetCache {
    targets: BTreeMap<TargetId, TargetData>,
    by_canonical_id: BTreeMap<String, TargetId>,
    matching_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
}

impl TargetCache {
    /// Reserves the next even target id.
    pub fn allocate_target_id(&mut self) -> TargetId {
        let target_id = TargetIdGenerator::for_target_cache(self.highest_target_id).next();
        self.highest_target_id = target_id;
        target_id
    }

    pub fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.highest_sequence_number += 1;
        self.highest_sequence_number
    }

    pub fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    pub fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        if self.targets.contains_key(&target_data.target_id) {
            return Err(internal_error(format!(
                "Target {} is already in the cache",
                target_data.target_id
            )));
        }
        self.save(target_data);
        Ok(())
    }

    /// Replaces the stored data of an existing target.
    ///
    /// A resume token never moves backwards: an update with an empty token or an
    /// older snapshot version keeps the stored token and version.
    pub fn update_target_data(&mut self, mut target_data: TargetData) -> FirestoreResult<()> {
        let Some(existing) = self.targets.get(&target_data.target_id) else {
            return Err(internal_error(format!(
                "Cannot update unknown target {}",
                target_data.target_id
            )));
        };
        if target_data.resume_token.is_empty()
            || target_data.snapshot_version < existing.snapshot_version
        {
            target_data.resume_token = existing.resume_token.clone();
            target_data.snapshot_version = existing.snapshot_version;
        }
        self.save(target_data);
        Ok(())
    }

    /// Forgets the resume token of a target whose results no longer match the
    /// server, so the next listen fetches it from scratch.
    pub fn reset_target(&mut self, target_id: TargetId) {
        if let Some(data) = self.targets.get_mut(&target_id) {
            data.resume_token.clear();
            data.snapshot_version = SnapshotVersion::none();
            data.last_limbo_free_snapshot_version = SnapshotVersion::none();
            data.expected_count = None;
        }
    }

    pub fn remove_target_data(&mut self, target_id: TargetId) {
        if let Some(data) = self.targets.remove(&target_id) {
            self.by_canonical_id.remove(&data.target.canonical_id());
        }
        self.matching_keys.remove(&target_id);
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.targets.get(target_id))
    }

    pub fn get_target_data_for_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn add_matching_keys<'a, I>(&mut self, keys: I, target_id: TargetId)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let entry = self.matching_keys.entry(target_id).or_default();
        entry.extend(keys.into_iter().cloned());
    }

    pub fn remove_matching_keys<'a, I>(&mut self, keys: I, target_id: TargetId)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        if let Some(entry) = self.matching_keys.get_mut(&target_id) {
            for key in keys {
                entry.remove(key);
            }
        }
    }

    pub fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) {
        self.matching_keys.remove(&target_id);
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.matching_keys.get(&target_id).cloned().unwrap_or_default()
    }

    /// Whether any target references `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.matching_keys.values().any(|keys| keys.contains(key))
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn set_target_global_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
    }

    pub fn target_ids(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.targets.keys().copied()
    }

    fn save(&mut self, target_data: TargetData) {
        self.highest_target_id = self.highest_target_id.max(target_data.target_id);
        self.highest_sequence_number = self
            .highest_sequence_number
            .max(target_data.sequence_number);
        self.by_canonical_id
            .insert(target_data.target.canonical_id(), target_data.target_id);
        self.targets.insert(target_data.target_id, target_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::ResourcePath;

    fn rooms_target() -> Target {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).to_target()
    }

    #[test]
    fn allocates_increasing_even_ids() {
        let mut cache = TargetCache::default();
        let first = cache.allocate_target_id();
        let second = cache.allocate_target_id();
        assert_eq!(first % 2, 0);
        assert!(second > first);
    }

    #[test]
    fn looks_targets_up_by_canonical_id() {
        let mut cache = TargetCache::default();
        let target_id = cache.allocate_target_id();
        let data = TargetData::new(rooms_target(), target_id, TargetPurpose::Listen, 1);
        cache.add_target_data(data.clone()).unwrap();
        assert_eq!(cache.get_target_data(&rooms_target()), Some(&data));
        assert!(cache.add_target_data(data).is_err());

        cache.remove_target_data(target_id);
        assert!(cache.get_target_data(&rooms_target()).is_none());
    }

    #[test]
    fn resume_token_never_moves_backwards() {
        let mut cache = TargetCache::default();
        let target_id = cache.allocate_target_id();
        let data = TargetData::new(rooms_target(), target_id, TargetPurpose::Listen, 1)
            .with_resume_token(b"v2".to_vec(), SnapshotVersion::from_micros(2));
        cache.add_target_data(data.clone()).unwrap();

        cache
            .update_target_data(data.with_resume_token(Vec::new(), SnapshotVersion::from_micros(3)))
            .unwrap();
        let stored = cache.get_target_data_for_id(target_id).unwrap();
        assert_eq!(stored.resume_token, b"v2".to_vec());

        cache
            .update_target_data(data.with_resume_token(b"v1".to_vec(), SnapshotVersion::from_micros(1)))
            .unwrap();
        let stored = cache.get_target_data_for_id(target_id).unwrap();
        assert_eq!(stored.snapshot_version, SnapshotVersion::from_micros(2));

        cache
            .update_target_data(data.with_resume_token(b"v3".to_vec(), SnapshotVersion::from_micros(3)))
            .unwrap();
        let stored = cache.get_target_data_for_id(target_id).unwrap();
        assert_eq!(stored.resume_token, b"v3".to_vec());
    }

    #[test]
    fn matching_keys_per_target() {
        let mut cache = TargetCache::default();
        let a = DocumentKey::from_string("rooms/a").unwrap();
        let b = DocumentKey::from_string("rooms/b").unwrap();
        cache.add_matching_keys([&a, &b], 2);
        cache.add_matching_keys([&a], 4);
        cache.remove_matching_keys([&a], 2);
        assert_eq!(cache.get_matching_keys_for_target_id(2).len(), 1);
        assert!(cache.contains_key(&a));
        cache.remove_matching_keys_for_target_id(4);
        assert!(!cache.contains_key(&a));
    }
}
