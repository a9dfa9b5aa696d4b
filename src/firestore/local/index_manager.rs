use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{equality_value, satisfies_range, Operator};
use crate::firestore::core::Target;
use crate::firestore::model::{DocumentKey, FieldIndex, FieldPath, IndexKind, MutableDocument};
use crate::firestore::value::{compare_values, FirestoreValue};

/// One document's position in a field index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub document_key: DocumentKey,
    pub values: Vec<FirestoreValue>,
}

/// Client-side field indexes and their entries.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexManager {
    next_index_id: i32,
    indexes: BTreeMap<i32, FieldIndex>,
    entries: BTreeMap<i32, Vec<IndexEntry>>,
}

impl IndexManager {
    /// Replaces the configured indexes. Indexes whose definition did not change
    /// keep their id and entries; new ones are backfilled from `documents`.
    pub fn configure_field_indexes<'a, I>(&mut self, indexes: Vec<FieldIndex>, documents: I)
    where
        I: IntoIterator<Item = &'a MutableDocument> + Clone,
    {
        let mut kept = BTreeMap::new();
        let mut kept_entries = BTreeMap::new();
        for mut index in indexes {
            let existing = self
                .indexes
                .iter()
                .find(|(_, current)| current.same_definition(&index))
                .map(|(id, _)| *id);
            match existing {
                Some(id) => {
                    index.index_id = id;
                    kept_entries.insert(id, self.entries.remove(&id).unwrap_or_default());
                }
                None => {
                    self.next_index_id += 1;
                    index.index_id = self.next_index_id;
                    let mut entries: Vec<IndexEntry> = documents
                        .clone()
                        .into_iter()
                        .filter_map(|document| entry_for(&index, document))
                        .collect();
                    entries.sort_by(|left, right| compare_entries(&index, left, right));
                    kept_entries.insert(index.index_id, entries);
                }
            }
            kept.insert(index.index_id, index);
        }
        self.indexes = kept;
        self.entries = kept_entries;
    }

    pub fn field_indexes(&self) -> impl Iterator<Item = &FieldIndex> {
        self.indexes.values()
    }

    /// Brings every index in line with the new remote state of `document`.
    pub fn update_index_entries(&mut self, document: &MutableDocument) {
        for (id, index) in &self.indexes {
            let Some(entries) = self.entries.get_mut(id) else {
                continue;
            };
            entries.retain(|entry| &entry.document_key != document.key());
            if let Some(entry) = entry_for(index, document) {
                let position = entries
                    .binary_search_by(|probe| compare_entries(index, probe, &entry))
                    .unwrap_or_else(|position| position);
                entries.insert(position, entry);
            }
        }
    }

    pub fn remove_document(&mut self, key: &DocumentKey) {
        for entries in self.entries.values_mut() {
            entries.retain(|entry| &entry.document_key != key);
        }
    }

    /// Keys of the documents an index says match `target`, in index order, or
    /// `None` when no configured index can serve it.
    pub fn get_documents_matching_target(&self, target: &Target) -> Option<Vec<DocumentKey>> {
        let (id, index) = self.find_index(target)?;
        let entries = self.entries.get(id)?;
        let range_field = index.segments.last().map(|segment| &segment.field_path);
        let range_filters: Vec<_> = target
            .filters
            .iter()
            .filter(|filter| filter.op.is_inequality() && Some(&filter.field) == range_field)
            .collect();

        let keys = entries
            .iter()
            .filter(|entry| {
                index.segments.iter().zip(entry.values.iter()).all(|(segment, value)| {
                    match equality_value(&target.filters, &segment.field_path) {
                        Some(expected) => {
                            compare_values(value, expected) == Ordering::Equal
                        }
                        None => satisfies_range(&range_filters, value),
                    }
                })
            })
            .map(|entry| entry.document_key.clone())
            .collect();
        Some(keys)
    }

    /// Picks an index whose leading segments are exactly the equality fields of
    /// `target`, optionally followed by one segment for its single range or
    /// ordering field.
    fn find_index(&self, target: &Target) -> Option<(&i32, &FieldIndex)> {
        if target.is_document_query() {
            return None;
        }
        let collection_group = target
            .collection_group
            .clone()
            .or_else(|| target.path.last_segment().map(str::to_string))?;

        let mut equality_fields = BTreeSet::new();
        let mut range_fields = BTreeSet::new();
        for filter in &target.filters {
            match filter.op {
                Operator::Equal => {
                    equality_fields.insert(filter.field.clone());
                }
                Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual => {
                    range_fields.insert(filter.field.clone());
                }
                _ => return None,
            }
        }
        if range_fields.len() > 1 {
            return None;
        }
        let ordering_field: Option<FieldPath> = range_fields.into_iter().next().or_else(|| {
            target
                .order_by
                .iter()
                .map(|order| order.field.clone())
                .find(|field| !field.is_key_field() && !equality_fields.contains(field))
        });

        self.indexes.iter().find(|(_, index)| {
            if index.collection_group != collection_group {
                return false;
            }
            let expected_len = equality_fields.len() + usize::from(ordering_field.is_some());
            if index.segments.len() != expected_len {
                return false;
            }
            let (leading, trailing) = index.segments.split_at(equality_fields.len());
            let leading_fields: BTreeSet<FieldPath> =
                leading.iter().map(|segment| segment.field_path.clone()).collect();
            leading_fields == equality_fields
                && match (&ordering_field, trailing.first()) {
                    (Some(field), Some(segment)) => &segment.field_path == field,
                    (None, None) => true,
                    _ => false,
                }
        })
    }
}

fn entry_for(index: &FieldIndex, document: &MutableDocument) -> Option<IndexEntry> {
    if !document.is_found_document() || !document.key().has_collection_id(&index.collection_group) {
        return None;
    }
    let values = index
        .segments
        .iter()
        .map(|segment| document.field(&segment.field_path).cloned())
        .collect::<Option<Vec<_>>>()?;
    Some(IndexEntry {
        document_key: document.key().clone(),
        values,
    })
}

fn compare_entries(index: &FieldIndex, left: &IndexEntry, right: &IndexEntry) -> Ordering {
    for ((segment, l), r) in index.segments.iter().zip(&left.values).zip(&right.values) {
        let ordering = compare_values(l, r);
        let ordering = match segment.kind {
            IndexKind::Ascending => ordering,
            IndexKind::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.document_key.cmp(&right.document_key)
}
