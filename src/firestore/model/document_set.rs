use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::firestore::model::{DocumentKey, MutableDocument};

pub type DocumentComparator =
    Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync + 'static>;

/// Documents kept both by key and in query order. Ties fall back to key order.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// A set ordered only by document key.
    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|left: &MutableDocument, right: &MutableDocument| {
            left.key().cmp(right.key())
        }))
    }

    pub fn comparator(&self) -> DocumentComparator {
        self.comparator.clone()
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        (self.comparator)(left, right).then_with(|| left.key().cmp(right.key()))
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.delete(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let existing = self.by_key.remove(key)?;
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        }
        Some(existing)
    }

    fn position(&self, document: &MutableDocument) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|candidate| self.compare(candidate, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|doc| doc.key().to_string()))
            .finish()
    }
}
