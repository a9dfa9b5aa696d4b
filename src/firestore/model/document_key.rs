use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

/// Identifies a single document: a path with an even, non-zero number of segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Invalid document reference. Document references must have an even number of segments, but {path} has {}.",
                path.len()
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.parent()
    }

    /// The id of the collection directly containing this document.
    pub fn collection_group(&self) -> &str {
        self.path
            .segment(self.path.len().saturating_sub(2))
            .unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.path.fmt(f)
    }
}

impl Serialize for DocumentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.path.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DocumentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let path = ResourcePath::deserialize(deserializer)?;
        DocumentKey::from_path(path).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("rooms").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn exposes_collection_group() {
        let key = DocumentKey::from_string("rooms/eros/messages/1").unwrap();
        assert_eq!(key.id(), "1");
        assert_eq!(key.collection_group(), "messages");
        assert_eq!(key.collection_path().to_string(), "rooms/eros/messages");
    }

    #[test]
    fn usable_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(DocumentKey::from_string("rooms/a").unwrap(), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, "{\"rooms/a\":1}");
        let back: BTreeMap<DocumentKey, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
