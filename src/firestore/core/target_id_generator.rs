use crate::firestore::local::TargetId;

/// Hands out target ids from one of two disjoint sequences: even ids for
/// targets stored in the target cache, odd ids for limbo resolutions that the
/// sync engine never persists.
#[derive(Debug, Clone)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Continues the even sequence after `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let mut generator = Self { next_id: 0 };
        generator.seek(highest_target_id + 2);
        generator
    }

    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    fn seek(&mut self, target_id: TargetId) {
        // Round up to the next even id.
        self.next_id = target_id + (target_id & 1);
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}
