use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult,
    SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Marks "no batch" when scanning the queue.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// A document paired with the set of fields changed by local mutations.
/// `mutated_fields == None` means the whole document was replaced or deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

/// Mutations written together by one user. Base mutations carry values captured
/// at write time (for example the base of an increment) and are applied first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    pub fn affects(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|m| m.key() == key)
    }

    /// Applies the acknowledged results to the cached remote version of `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            let mutation_result = result.mutation_results.get(index).ok_or_else(|| {
                internal_error(format!(
                    "Missing mutation result {index} for batch {}",
                    self.batch_id
                ))
            })?;
            mutation.apply_to_remote_document(document, mutation_result)?;
        }
        Ok(())
    }

    /// Applies base mutations then mutations affecting `document` to its local view.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every document it touches and returns the overlay
    /// mutation to persist for each of them.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mut mutated_fields = self.apply_to_local_view(
                &mut overlayed.document,
                overlayed.mutated_fields.clone(),
            );
            // Without a remote version the overlay must carry the full document.
            if documents_without_remote_version.contains(&key) {
                mutated_fields = None;
            }
            if let Some(overlay) =
                calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref())
            {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mutated_fields;
            if !overlayed.document.is_valid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::none());
            }
        }
        overlays
    }
}

/// Server acknowledgement of a whole batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }

    /// Keys whose acknowledgement carried server computed transform values.
    pub fn keys_with_transform_results(&self) -> BTreeSet<DocumentKey> {
        self.batch
            .mutations
            .iter()
            .zip(self.mutation_results.iter())
            .filter(|(_, result)| !result.transform_results.is_empty())
            .map(|(mutation, _)| mutation.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(name: &str) -> MapValue {
        let mut map = MapValue::empty();
        map.set(
            &FieldPath::from_dot_separated("name").unwrap(),
            FirestoreValue::from_string(name),
        );
        map
    }

    #[test]
    fn result_requires_one_result_per_mutation() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("c/a"), data("a"))],
        );
        let err = MutationBatchResult::from(batch, SnapshotVersion::from_micros(1), Vec::new(), Vec::new())
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[test]
    fn local_document_set_produces_overlays() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            Vec::new(),
            vec![
                Mutation::set(key("c/a"), data("a")),
                Mutation::delete(key("c/b")),
            ],
        );
        let mut documents = BTreeMap::new();
        for path in ["c/a", "c/b"] {
            documents.insert(
                key(path),
                OverlayedDocument {
                    document: MutableDocument::new_invalid(key(path)),
                    mutated_fields: Some(FieldMask::empty()),
                },
            );
        }
        let without_remote: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let overlays = batch.apply_to_local_document_set(&mut documents, &without_remote);
        assert!(matches!(overlays.get(&key("c/a")), Some(Mutation::Set { .. })));
        assert!(matches!(overlays.get(&key("c/b")), Some(Mutation::Delete { .. })));
        assert!(documents[&key("c/a")].document.is_found_document());
        assert!(documents[&key("c/b")].document.is_no_document());
    }
}
