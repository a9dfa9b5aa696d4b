use serde::{Deserialize, Serialize};

use crate::firestore::model::{BatchId, DocumentKey, Mutation};

/// The mutation that turns a cached remote document into its local view, tagged
/// with the largest batch that contributed to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
