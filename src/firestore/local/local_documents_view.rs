use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::local::persistence::PersistedState;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, MutableDocument, Overlay,
    OverlayedDocument, SnapshotVersion, Timestamp,
};

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Local views of documents: the cached remote version with the user's saved
/// overlay applied on top.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    user_id: String,
}

impl LocalDocumentsView {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Local view of `key`, an invalid document when nothing is known.
    pub fn get_document(&self, state: &PersistedState, key: &DocumentKey) -> MutableDocument {
        let mut document = state.remote_documents.get_entry(key);
        if let Some(overlay) = state.overlays.get_overlay(&self.user_id, key) {
            apply_overlay(overlay, &mut document);
        }
        document
    }

    pub fn get_documents<'a, I>(&self, state: &PersistedState, keys: I) -> DocumentMap
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_document(state, key)))
            .collect()
    }

    /// Applies saved overlays to `documents`, which hold remote versions.
    ///
    /// Documents whose existence changed remotely and that carry no overlay, or
    /// only a patch overlay, get their overlays recomputed from the mutation
    /// queue since a patch may now apply to a different base.
    pub fn get_overlayed_documents(
        &self,
        state: &mut PersistedState,
        documents: DocumentMap,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let overlays = state.overlays.get_overlays(&self.user_id, documents.keys());
        let mut recalculate = DocumentMap::new();
        let mut result = BTreeMap::new();
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();

        for (key, mut document) in documents {
            let overlay = overlays.get(&key);
            let is_patch_or_missing = overlay
                .map(|overlay| overlay.mutation.field_mask().is_some())
                .unwrap_or(true);
            if existence_state_changed.contains(&key) && is_patch_or_missing {
                recalculate.insert(key, document);
                continue;
            }
            if let Some(overlay) = overlay {
                masks.insert(key.clone(), overlay.mutation.field_mask());
                apply_overlay(overlay, &mut document);
            }
            result.insert(
                key.clone(),
                OverlayedDocument {
                    document,
                    mutated_fields: masks.remove(&key).flatten(),
                },
            );
        }

        if !recalculate.is_empty() {
            let (documents, recalculated_masks) =
                self.recalculate_and_save_overlays(state, recalculate);
            for (key, document) in documents {
                let mutated_fields = recalculated_masks.get(&key).cloned().flatten();
                result.insert(
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields,
                    },
                );
            }
        }
        result
    }

    /// Replays the user's queued batches over the remote `documents` and saves
    /// one overlay per document, stamped with the newest batch touching it.
    /// Returns the resulting local views and the mutated field masks.
    pub fn recalculate_and_save_overlays(
        &self,
        state: &mut PersistedState,
        mut documents: DocumentMap,
    ) -> (DocumentMap, BTreeMap<DocumentKey, Option<FieldMask>>) {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let batches = state
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(&self.user_id, &keys);

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks.remove(&key).unwrap_or(Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, batch_keys) in keys_by_batch.iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in batch_keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(document) = documents.get(key) else {
                    continue;
                };
                let mask = masks.get(key).cloned().flatten();
                match calculate_overlay_mutation(document, mask.as_ref()) {
                    Some(mutation) => {
                        overlays.insert(key.clone(), mutation);
                    }
                    None => state.overlays.remove_overlay(&self.user_id, key),
                }
            }
            state.overlays.save_overlays(&self.user_id, *batch_id, overlays);
        }

        for key in &keys {
            if !processed.contains(key) {
                state.overlays.remove_overlay(&self.user_id, key);
            }
        }
        (documents, masks)
    }

    /// Recomputes overlays for `keys` from their current remote versions.
    pub fn recalculate_and_save_overlays_for_keys(
        &self,
        state: &mut PersistedState,
        keys: &BTreeSet<DocumentKey>,
    ) -> DocumentMap {
        let documents = state.remote_documents.get_entries(keys);
        self.recalculate_and_save_overlays(state, documents).0
    }

    /// Every document whose local view matches `query`, considering only remote
    /// documents read after `since_read_time`. Documents with overlays are
    /// always considered.
    pub fn get_documents_matching_query(
        &self,
        state: &PersistedState,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        if query.is_document_query() {
            return self.get_document_matching_document_query(state, query);
        }
        let remote = match &query.collection_group {
            Some(group) => {
                state
                    .remote_documents
                    .get_documents_in_collection_group(&query.path, group, since_read_time)
            }
            None => state
                .remote_documents
                .get_documents_in_collection(&query.path, since_read_time),
        };
        self.apply_overlays_and_filter(state, query, remote)
    }

    /// Like `get_documents_matching_query`, but the remote candidates are the
    /// given keys instead of a collection scan.
    pub fn get_documents_matching_query_for_keys<'a, I>(
        &self,
        state: &PersistedState,
        query: &Query,
        keys: I,
    ) -> DocumentMap
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let remote = state.remote_documents.get_entries(keys);
        self.apply_overlays_and_filter(state, query, remote)
    }

    fn get_document_matching_document_query(&self, state: &PersistedState, query: &Query) -> DocumentMap {
        let mut result = DocumentMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path.clone()) {
            let document = self.get_document(state, &key);
            if document.is_found_document() {
                result.insert(key, document);
            }
        }
        result
    }

    fn apply_overlays_and_filter(
        &self,
        state: &PersistedState,
        query: &Query,
        mut documents: DocumentMap,
    ) -> DocumentMap {
        let overlays = self.overlays_for_query(state, query);
        for key in overlays.keys() {
            if !documents.contains_key(key) {
                documents.insert(key.clone(), state.remote_documents.get_entry(key));
            }
        }
        documents
            .into_iter()
            .filter_map(|(key, mut document)| {
                if let Some(overlay) = overlays.get(&key) {
                    apply_overlay(overlay, &mut document);
                }
                query.matches(&document).then_some((key, document))
            })
            .collect()
    }

    fn overlays_for_query(&self, state: &PersistedState, query: &Query) -> BTreeMap<DocumentKey, Overlay> {
        match &query.collection_group {
            Some(group) => state
                .overlays
                .get_overlays_for_collection_group(&self.user_id, group, -1)
                .into_iter()
                .filter(|(key, _)| query.path.is_prefix_of(key.path()))
                .collect(),
            None => state
                .overlays
                .get_overlays_for_collection(&self.user_id, &query.path, -1),
        }
    }
}

fn apply_overlay(overlay: &Overlay, document: &mut MutableDocument) {
    overlay
        .mutation
        .apply_to_local_view(document, Some(FieldMask::empty()), Timestamp::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, Mutation};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use crate::firestore::model::ResourcePath;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(
            &FieldPath::from_dot_separated(field).unwrap(),
            FirestoreValue::from_integer(value),
        );
        map
    }

    fn queue(state: &mut PersistedState, mutations: Vec<Mutation>) {
        state
            .mutation_queue
            .add_mutation_batch("u", Timestamp::now(), Vec::new(), mutations)
            .unwrap();
    }

    #[test]
    fn overlays_replace_replaying_the_queue() {
        let mut state = PersistedState::default();
        state
            .remote_documents
            .set_entry(
                MutableDocument::new_found(key("c/a"), SnapshotVersion::from_micros(1), data("n", 1)),
                SnapshotVersion::from_micros(1),
            )
            .unwrap();
        queue(&mut state, vec![Mutation::patch(key("c/a"), data("m", 2))]);
        queue(&mut state, vec![Mutation::set(key("c/b"), data("n", 3))]);

        let view = LocalDocumentsView::new("u");
        view.recalculate_and_save_overlays_for_keys(
            &mut state,
            &BTreeSet::from([key("c/a"), key("c/b")]),
        );

        let a = view.get_document(&state, &key("c/a"));
        assert!(a.has_local_mutations());
        assert_eq!(a.data().get(&FieldPath::from_dot_separated("n").unwrap()), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(a.data().get(&FieldPath::from_dot_separated("m").unwrap()), Some(&FirestoreValue::from_integer(2)));

        let query = Query::collection(ResourcePath::from_string("c").unwrap());
        let matches = view.get_documents_matching_query(&state, &query, SnapshotVersion::none());
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn overlays_are_per_user() {
        let mut state = PersistedState::default();
        queue(&mut state, vec![Mutation::set(key("c/a"), data("n", 1))]);
        LocalDocumentsView::new("u")
            .recalculate_and_save_overlays_for_keys(&mut state, &BTreeSet::from([key("c/a")]));

        let other = LocalDocumentsView::new("v");
        assert!(!other.get_document(&state, &key("c/a")).is_valid_document());
    }

    #[test]
    fn removed_batches_drop_their_overlay() {
        let mut state = PersistedState::default();
        queue(&mut state, vec![Mutation::delete(key("c/a"))]);
        let view = LocalDocumentsView::new("u");
        let keys = BTreeSet::from([key("c/a")]);
        view.recalculate_and_save_overlays_for_keys(&mut state, &keys);
        assert!(view.get_document(&state, &key("c/a")).is_no_document());

        let batch = state.mutation_queue.get_all_mutation_batches("u").remove(0);
        state.mutation_queue.remove_mutation_batch("u", &batch).unwrap();
        view.recalculate_and_save_overlays_for_keys(&mut state, &keys);
        assert!(!view.get_document(&state, &key("c/a")).is_valid_document());
    }
}
