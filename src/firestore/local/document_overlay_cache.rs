use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Saved overlays per user. Each key carries at most one overlay, stamped with
/// the largest batch id that contributed to it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DocumentOverlayCache {
    overlays: BTreeMap<String, BTreeMap<DocumentKey, Overlay>>,
}

impl DocumentOverlayCache {
    pub fn get_overlay(&self, user_id: &str, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(user_id).and_then(|user| user.get(key))
    }

    pub fn get_overlays<'a, I>(&self, user_id: &str, keys: I) -> BTreeMap<DocumentKey, Overlay>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .filter_map(|key| {
                self.get_overlay(user_id, key)
                    .map(|overlay| (key.clone(), overlay.clone()))
            })
            .collect()
    }

    pub fn save_overlays(
        &mut self,
        user_id: &str,
        largest_batch_id: BatchId,
        mutations: BTreeMap<DocumentKey, Mutation>,
    ) {
        let user = self.overlays.entry(user_id.to_string()).or_default();
        for (key, mutation) in mutations {
            user.insert(key, Overlay::new(largest_batch_id, mutation));
        }
    }

    /// Drops overlays of `keys` that were produced by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &mut self,
        user_id: &str,
        keys: &BTreeSet<DocumentKey>,
        batch_id: BatchId,
    ) {
        if let Some(user) = self.overlays.get_mut(user_id) {
            user.retain(|key, overlay| !(keys.contains(key) && overlay.largest_batch_id == batch_id));
        }
    }

    pub fn remove_overlay(&mut self, user_id: &str, key: &DocumentKey) {
        if let Some(user) = self.overlays.get_mut(user_id) {
            user.remove(key);
        }
    }

    /// Overlays of documents directly inside `collection` newer than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        user_id: &str,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.user_overlays(user_id)
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path()) && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    pub fn get_overlays_for_collection_group(
        &self,
        user_id: &str,
        collection_id: &str,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.user_overlays(user_id)
            .filter(|(key, overlay)| {
                key.has_collection_id(collection_id) && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    fn user_overlays<'a>(
        &'a self,
        user_id: &str,
    ) -> impl Iterator<Item = (&'a DocumentKey, &'a Overlay)> + 'a {
        self.overlays.get(user_id).into_iter().flat_map(|user| user.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn overlays_are_replaced_and_removed_by_batch() {
        let mut cache = DocumentOverlayCache::default();
        cache.save_overlays(
            "u",
            1,
            BTreeMap::from([(key("c/a"), Mutation::set(key("c/a"), MapValue::empty()))]),
        );
        cache.save_overlays("u", 2, BTreeMap::from([(key("c/a"), Mutation::delete(key("c/a")))]));
        assert_eq!(cache.get_overlay("u", &key("c/a")).unwrap().largest_batch_id, 2);

        let keys = BTreeSet::from([key("c/a")]);
        cache.remove_overlays_for_batch_id("u", &keys, 1);
        assert!(cache.get_overlay("u", &key("c/a")).is_some());
        cache.remove_overlays_for_batch_id("u", &keys, 2);
        assert!(cache.get_overlay("u", &key("c/a")).is_none());
    }

    #[test]
    fn collection_lookup_respects_batch_threshold_and_user() {
        let mut cache = DocumentOverlayCache::default();
        cache.save_overlays("u", 1, BTreeMap::from([(key("c/a"), Mutation::delete(key("c/a")))]));
        cache.save_overlays("u", 3, BTreeMap::from([(key("c/b"), Mutation::delete(key("c/b")))]));
        cache.save_overlays(
            "u",
            3,
            BTreeMap::from([(key("c/b/d/e"), Mutation::delete(key("c/b/d/e")))]),
        );
        cache.save_overlays("v", 3, BTreeMap::from([(key("c/z"), Mutation::delete(key("c/z")))]));

        let c = ResourcePath::from_string("c").unwrap();
        assert_eq!(cache.get_overlays_for_collection("u", &c, 0).len(), 2);
        assert_eq!(cache.get_overlays_for_collection("u", &c, 1).len(), 1);
        assert_eq!(cache.get_overlays_for_collection_group("u", "d", 0).len(), 1);
    }
}
