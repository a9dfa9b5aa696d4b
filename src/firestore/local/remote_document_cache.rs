use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, ResourcePath, SnapshotVersion};

/// Last known server state of every cached document, including tombstones.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteDocumentCache {
    entries: BTreeMap<DocumentKey, MutableDocument>,
}

impl RemoteDocumentCache {
    /// Stores `document` stamped with `read_time`, the version at which it was read.
    pub fn set_entry(
        &mut self,
        mut document: MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        if read_time.is_none() {
            return Err(invalid_argument(format!(
                "Cannot add document {} to the cache with a read time of zero",
                document.key()
            )));
        }
        document.set_read_time(read_time);
        self.entries.insert(document.key().clone(), document);
        Ok(())
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) {
        self.entries.remove(key);
    }

    /// Returns the cached document or an invalid document when nothing is cached.
    pub fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()))
    }

    pub fn get_entries<'a, I>(&self, keys: I) -> BTreeMap<DocumentKey, MutableDocument>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Documents directly inside `collection` read after `since_read_time`.
    pub fn get_documents_in_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let start = match DocumentKey::from_path(collection.child("")) {
            Ok(key) => key,
            Err(_) => return BTreeMap::new(),
        };
        self.entries
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, doc)| {
                collection.is_immediate_parent_of(key.path()) && doc.read_time() > since_read_time
            })
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    /// Documents of every collection named `collection_id` under `parent`.
    pub fn get_documents_in_collection_group(
        &self,
        parent: &ResourcePath,
        collection_id: &str,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        self.entries
            .iter()
            .filter(|(key, doc)| {
                key.has_collection_id(collection_id)
                    && parent.is_prefix_of(key.path())
                    && doc.read_time() > since_read_time
            })
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    /// Every entry read after `since_read_time`, tombstones included.
    pub fn get_changes_since(&self, since_read_time: SnapshotVersion) -> BTreeMap<DocumentKey, MutableDocument> {
        self.entries
            .iter()
            .filter(|(_, doc)| doc.read_time() > since_read_time)
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    pub fn latest_read_time(&self) -> SnapshotVersion {
        self.entries
            .values()
            .map(MutableDocument::read_time)
            .max()
            .unwrap_or_default()
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> + Clone {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn found(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            MapValue::empty(),
        )
    }

    #[test]
    fn missing_entries_are_invalid_documents() {
        let cache = RemoteDocumentCache::default();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        assert!(!cache.get_entry(&key).is_valid_document());
    }

    #[test]
    fn rejects_zero_read_time() {
        let mut cache = RemoteDocumentCache::default();
        assert!(cache.set_entry(found("rooms/a", 1), SnapshotVersion::none()).is_err());
    }

    #[test]
    fn collection_scan_skips_nested_and_old_documents() {
        let mut cache = RemoteDocumentCache::default();
        cache.set_entry(found("rooms/a", 1), SnapshotVersion::from_micros(1)).unwrap();
        cache.set_entry(found("rooms/b", 5), SnapshotVersion::from_micros(5)).unwrap();
        cache
            .set_entry(found("rooms/a/messages/1", 5), SnapshotVersion::from_micros(5))
            .unwrap();
        cache.set_entry(found("roomsx/c", 5), SnapshotVersion::from_micros(5)).unwrap();

        let rooms = ResourcePath::from_string("rooms").unwrap();
        let all = cache.get_documents_in_collection(&rooms, SnapshotVersion::none());
        assert_eq!(all.len(), 2);
        let recent = cache.get_documents_in_collection(&rooms, SnapshotVersion::from_micros(1));
        assert_eq!(recent.len(), 1);

        let group = cache.get_documents_in_collection_group(
            &ResourcePath::root(),
            "messages",
            SnapshotVersion::none(),
        );
        assert_eq!(group.len(), 1);
    }
}
