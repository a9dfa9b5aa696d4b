use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, invalid_argument, FirestoreResult};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, ResourcePath, Timestamp, BATCH_ID_UNKNOWN,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct QueuedBatch {
    user_id: String,
    batch: MutationBatch,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct QueueMetadata {
    last_acknowledged_batch_id: BatchId,
    last_stream_token: Vec<u8>,
}

/// Pending writes of every user, keyed by batch id.
///
/// Batch ids come from one counter shared by all users. The counter is part of
/// the persisted state and is never rewound, so an id is never handed out twice
/// even after the batch that carried it was removed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationQueue {
    next_batch_id: BatchId,
    batches: BTreeMap<BatchId, QueuedBatch>,
    metadata: BTreeMap<String, QueueMetadata>,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self {
            next_batch_id: 1,
            batches: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl MutationQueue {
    pub fn add_mutation_batch(
        &mut self,
        user_id: &str,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(invalid_argument("Mutation batches should not be empty"));
        }
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        self.batches.insert(
            batch_id,
            QueuedBatch {
                user_id: user_id.to_string(),
                batch: batch.clone(),
            },
        );
        Ok(batch)
    }

    pub fn lookup_mutation_batch(&self, user_id: &str, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches
            .get(&batch_id)
            .filter(|queued| queued.user_id == user_id)
            .map(|queued| &queued.batch)
    }

    /// Looks a batch up regardless of its owner. Secondary clients use this to
    /// follow batch state changes published by the primary.
    pub fn lookup_any_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id).map(|queued| &queued.batch)
    }

    /// First batch of `user_id` with an id greater than `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id<'a>(
        &'a self,
        user_id: &'a str,
        batch_id: BatchId,
    ) -> Option<&'a MutationBatch> {
        self.user_batches(user_id)
            .find(|batch| batch.batch_id > batch_id)
    }

    pub fn get_highest_unacknowledged_batch_id(&self, user_id: &str) -> BatchId {
        self.user_batches(user_id)
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn get_all_mutation_batches(&self, user_id: &str) -> Vec<MutationBatch> {
        self.user_batches(user_id).cloned().collect()
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        user_id: &str,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        self.user_batches(user_id)
            .filter(|batch| batch.affects(key))
            .cloned()
            .collect()
    }

    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        user_id: &str,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch> {
        self.user_batches(user_id)
            .filter(|batch| batch.mutations.iter().any(|m| keys.contains(m.key())))
            .cloned()
            .collect()
    }

    /// Batches touching any document below `path`.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        user_id: &str,
        path: &ResourcePath,
    ) -> Vec<MutationBatch> {
        self.user_batches(user_id)
            .filter(|batch| {
                batch
                    .mutations
                    .iter()
                    .any(|m| path.is_prefix_of(m.key().path()))
            })
            .cloned()
            .collect()
    }

    pub fn remove_mutation_batch(&mut self, user_id: &str, batch: &MutationBatch) -> FirestoreResult<()> {
        match self.batches.get(&batch.batch_id) {
            Some(queued) if queued.user_id == user_id => {
                self.batches.remove(&batch.batch_id);
                Ok(())
            }
            _ => Err(internal_error(format!(
                "Cannot remove batch {} that is not in the queue of {user_id:?}",
                batch.batch_id
            ))),
        }
    }

    /// Records an acknowledgement together with the stream token that came with it.
    pub fn acknowledge_batch(&mut self, user_id: &str, batch: &MutationBatch, stream_token: Vec<u8>) {
        let metadata = self.metadata.entry(user_id.to_string()).or_default();
        metadata.last_acknowledged_batch_id = metadata.last_acknowledged_batch_id.max(batch.batch_id);
        metadata.last_stream_token = stream_token;
    }

    pub fn last_stream_token(&self, user_id: &str) -> Vec<u8> {
        self.metadata
            .get(user_id)
            .map(|metadata| metadata.last_stream_token.clone())
            .unwrap_or_default()
    }

    pub fn set_last_stream_token(&mut self, user_id: &str, stream_token: Vec<u8>) {
        self.metadata
            .entry(user_id.to_string())
            .or_default()
            .last_stream_token = stream_token;
    }

    pub fn is_empty(&self, user_id: &str) -> bool {
        self.user_batches(user_id).next().is_none()
    }

    /// Every key with at least one pending mutation, for any user.
    pub fn keys_with_pending_mutations(&self) -> BTreeSet<DocumentKey> {
        self.batches
            .values()
            .flat_map(|queued| queued.batch.keys())
            .collect()
    }

    fn user_batches<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a MutationBatch> + 'a {
        self.batches
            .values()
            .filter(move |queued| queued.user_id == user_id)
            .map(|queued| &queued.batch)
    }
}
