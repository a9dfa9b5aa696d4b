use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::target_data::TargetId;
use crate::firestore::model::DocumentKey;

/// Which targets reference which documents, queryable in both directions.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    by_target: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, target_id: TargetId) {
        self.by_key.entry(key.clone()).or_default().insert(target_id);
        self.by_target.entry(target_id).or_default().insert(key);
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, target_id: TargetId) {
        if let Some(targets) = self.by_key.get_mut(key) {
            targets.remove(&target_id);
            if targets.is_empty() {
                self.by_key.remove(key);
            }
        }
        if let Some(keys) = self.by_target.get_mut(&target_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_target.remove(&target_id);
            }
        }
    }

    /// Drops every reference held by `target_id` and returns the keys involved.
    pub fn remove_references_for_id(&mut self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let keys = self.by_target.remove(&target_id).unwrap_or_default();
        for key in &keys {
            if let Some(targets) = self.by_key.get_mut(key) {
                targets.remove(&target_id);
                if targets.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.by_key.clear();
        self.by_target.clear();
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn references_for_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.by_target.get(&target_id).cloned().unwrap_or_default()
    }
}
