use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::firestore::core::{Query, Target};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::local_documents_view::{DocumentMap, LocalDocumentsView};
use crate::firestore::local::persistence::{
    ignore_if_primary_lease_loss, PersistedState, Persistence, TransactionMode,
};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::target_data::{TargetData, TargetId, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, FieldIndex, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, Timestamp, User,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};

/// A resume token older than this is persisted even without document changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug, PartialEq)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Outcome of switching the active user.
#[derive(Clone, Debug, PartialEq)]
pub struct UserChangeResult {
    /// Local views of every document touched by either user's batches.
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Keys that entered or left a view, reported back after a snapshot was raised.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

struct LocalStoreState {
    user: User,
    documents_view: LocalDocumentsView,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, TargetId>,
    /// Document keys of batches this client has seen, kept after the batch
    /// leaves the queue so secondary clients can still refresh their views.
    batch_keys: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
    /// Documents currently shown by a view, per target.
    local_view_references: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    last_document_change_read_time: SnapshotVersion,
}

/// The local half of the client: turns writes, remote events and queries into
/// persistence transactions and tracks the targets this client listens to.
pub struct LocalStore {
    persistence: Arc<Persistence>,
    /// Set when several clients share the persistence. Remote results may then
    /// only be applied while this client holds the primary lease.
    client_id: Option<String>,
    query_engine: QueryEngine,
    inner: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, user: User, client_id: Option<String>) -> Self {
        let documents_view = LocalDocumentsView::new(user.key());
        Self {
            persistence,
            client_id,
            query_engine: QueryEngine,
            inner: Mutex::new(LocalStoreState {
                user,
                documents_view,
                target_data_by_target: BTreeMap::new(),
                target_ids_by_canonical_id: BTreeMap::new(),
                batch_keys: BTreeMap::new(),
                local_view_references: BTreeMap::new(),
                last_document_change_read_time: SnapshotVersion::none(),
            }),
        }
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn current_user(&self) -> User {
        self.lock().user.clone()
    }

    /// Marks every cached document as already seen by `get_new_document_changes`.
    pub fn start(&self) -> FirestoreResult<()> {
        let read_time = self
            .persistence
            .read("start local store", |state| Ok(state.remote_documents.latest_read_time()))?;
        self.lock().last_document_change_read_time = read_time;
        Ok(())
    }

    fn primary_mode(&self) -> TransactionMode<'_> {
        match &self.client_id {
            Some(client_id) => TransactionMode::ReadWritePrimary(client_id),
            None => TransactionMode::ReadWrite,
        }
    }

    /// Queues `mutations` as a new batch and returns the resulting local views.
    pub fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let mut inner = self.lock();
        let documents_view = inner.documents_view.clone();

        let (batch, changes) =
            self.persistence
                .run_transaction("write locally", TransactionMode::ReadWrite, |state| {
                    let remote = state.remote_documents.get_entries(&keys);
                    let without_remote_version: BTreeSet<DocumentKey> = remote
                        .iter()
                        .filter(|(_, document)| !document.is_valid_document())
                        .map(|(key, _)| key.clone())
                        .collect();
                    let mut overlayed =
                        documents_view.get_overlayed_documents(state, remote, &BTreeSet::new());

                    // Non-idempotent transforms record the value they started from so
                    // the local view does not flicker when the backend echoes them.
                    let base_mutations: Vec<Mutation> = mutations
                        .iter()
                        .filter_map(|mutation| {
                            let document = &overlayed.get(mutation.key())?.document;
                            let base = mutation.extract_transform_base_value(document)?;
                            Some(Mutation::patch(mutation.key().clone(), base))
                        })
                        .collect();

                    let batch = state.mutation_queue.add_mutation_batch(
                        documents_view.user_id(),
                        local_write_time,
                        base_mutations,
                        mutations,
                    )?;
                    let overlays = batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
                    state
                        .overlays
                        .save_overlays(documents_view.user_id(), batch.batch_id, overlays);
                    let changes: DocumentMap = overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect();
                    Ok((batch, changes))
                })?;

        inner.batch_keys.insert(batch.batch_id, keys);
        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes,
        })
    }

    /// Applies a server acknowledgement: the acknowledged versions land in the
    /// remote cache, the batch leaves the queue, and overlays are rebuilt.
    pub fn acknowledge_batch(&self, result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let inner = self.lock();
        let documents_view = inner.documents_view.clone();
        let user_id = documents_view.user_id().to_string();
        let affected = result.batch.keys();

        self.persistence
            .run_transaction("acknowledge batch", self.primary_mode(), |state| {
                state
                    .mutation_queue
                    .acknowledge_batch(&user_id, &result.batch, result.stream_token.clone());

                for key in &affected {
                    let mut document = state.remote_documents.get_entry(key);
                    let ack_version = result.doc_versions.get(key).copied().ok_or_else(|| {
                        internal_error(format!("Missing acknowledged version for {key}"))
                    })?;
                    if document.version() < ack_version {
                        result.batch.apply_to_remote_document(&mut document, result)?;
                        // The commit version is the read time: a no-op update does not
                        // advance the document's update time.
                        if document.is_valid_document() && !result.commit_version.is_none() {
                            state.set_remote_document(document, result.commit_version)?;
                        }
                    }
                }

                state.mutation_queue.remove_mutation_batch(&user_id, &result.batch)?;
                state
                    .overlays
                    .remove_overlays_for_batch_id(&user_id, &affected, result.batch.batch_id);
                documents_view.recalculate_and_save_overlays_for_keys(state, &affected);
                Ok(documents_view.get_documents(state, &affected))
            })
    }

    /// Drops a batch the backend rejected and returns the rolled back views.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let inner = self.lock();
        let documents_view = inner.documents_view.clone();
        let user_id = documents_view.user_id().to_string();

        self.persistence
            .run_transaction("reject batch", self.primary_mode(), |state| {
                let batch = state
                    .mutation_queue
                    .lookup_mutation_batch(&user_id, batch_id)
                    .cloned()
                    .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                let affected = batch.keys();
                state.mutation_queue.remove_mutation_batch(&user_id, &batch)?;
                state
                    .overlays
                    .remove_overlays_for_batch_id(&user_id, &affected, batch_id);
                documents_view.recalculate_and_save_overlays_for_keys(state, &affected);
                Ok(documents_view.get_documents(state, &affected))
            })
    }

    /// Applies one consistent snapshot from the watch stream and returns the
    /// local views of every changed document.
    pub fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let mut inner = self.lock();
        let documents_view = inner.documents_view.clone();
        let mut target_data_by_target = inner.target_data_by_target.clone();
        let remote_version = event.snapshot_version;

        let changes = self
            .persistence
            .run_transaction("apply remote event", self.primary_mode(), |state| {
                let sequence_number = state.target_cache.next_sequence_number();

                for (target_id, change) in &event.target_changes {
                    // Only active targets get their matching keys updated so that the
                    // keys are always persisted together with the target.
                    let Some(old_target_data) = target_data_by_target.get(target_id).cloned() else {
                        continue;
                    };
                    state
                        .target_cache
                        .remove_matching_keys(&change.removed_documents, *target_id);
                    state
                        .target_cache
                        .add_matching_keys(&change.added_documents, *target_id);

                    let mismatched = event.target_mismatches.contains_key(target_id);
                    let mut new_target_data = old_target_data.with_sequence_number(sequence_number);
                    if mismatched {
                        new_target_data = new_target_data
                            .with_resume_token(Vec::new(), SnapshotVersion::none())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::none());
                    } else if !change.resume_token.is_empty() {
                        new_target_data =
                            new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                    }

                    if mismatched {
                        state.target_cache.update_target_data(new_target_data.clone())?;
                        state.target_cache.reset_target(*target_id);
                    } else if should_persist_target_data(&old_target_data, &new_target_data, change) {
                        state.target_cache.update_target_data(new_target_data.clone())?;
                    }
                    target_data_by_target.insert(*target_id, new_target_data);
                }

                let (changed, existence_changed) =
                    populate_document_changes(state, &event.document_updates, remote_version)?;

                if !remote_version.is_none() {
                    let last = state.target_cache.last_remote_snapshot_version();
                    if remote_version < last {
                        return Err(internal_error(format!(
                            "Watch stream reverted to previous snapshot {remote_version} < {last}"
                        )));
                    }
                    state.target_cache.set_target_global_version(remote_version);
                }

                let overlayed = documents_view.get_overlayed_documents(state, changed, &existence_changed);
                Ok(overlayed
                    .into_iter()
                    .map(|(key, overlayed)| (key, overlayed.document))
                    .collect::<DocumentMap>())
            })?;

        inner.target_data_by_target = target_data_by_target;
        Ok(changes)
    }

    /// Returns the target data for `target`, assigning a target id the first
    /// time the target is seen.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut inner = self.lock();
        let target_data = self
            .persistence
            .run_transaction("allocate target", TransactionMode::ReadWrite, |state| {
                if let Some(cached) = state.target_cache.get_target_data(&target) {
                    return Ok(cached.clone());
                }
                let target_id = state.target_cache.allocate_target_id();
                let sequence_number = state.target_cache.next_sequence_number();
                let target_data =
                    TargetData::new(target.clone(), target_id, TargetPurpose::Listen, sequence_number);
                state.target_cache.add_target_data(target_data.clone())?;
                Ok(target_data)
            })?;

        // Another client may have persisted newer data than this client holds.
        let is_newer = inner
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if is_newer {
            inner
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            inner
                .target_ids_by_canonical_id
                .insert(target.canonical_id(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// Stops tracking a target. With `keep_persisted_target_data` the persisted
    /// target and its documents stay untouched. Otherwise the target is aged out
    /// (durable cache) or removed eagerly together with documents nothing else
    /// references (memory cache).
    pub fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let mut inner = self.lock();
        let Some(target_data) = inner.target_data_by_target.remove(&target_id) else {
            return Err(internal_error(format!("Tried to release nonexistent target {target_id}")));
        };
        inner
            .target_ids_by_canonical_id
            .remove(&target_data.target.canonical_id());
        inner.local_view_references.remove(&target_id);

        if keep_persisted_target_data {
            return Ok(());
        }

        let referenced: BTreeSet<DocumentKey> =
            inner.local_view_references.values().flatten().cloned().collect();
        let durable = self.persistence.is_durable();
        let result = self
            .persistence
            .run_transaction("release target", self.primary_mode(), |state| {
                if durable {
                    let sequence_number = state.target_cache.next_sequence_number();
                    if state.target_cache.get_target_data_for_id(target_id).is_some() {
                        state
                            .target_cache
                            .update_target_data(target_data.with_sequence_number(sequence_number))?;
                    }
                    return Ok(());
                }
                let candidates = state.target_cache.get_matching_keys_for_target_id(target_id);
                state.target_cache.remove_target_data(target_id);
                let pending = state.mutation_queue.keys_with_pending_mutations();
                for key in candidates {
                    if !state.target_cache.contains_key(&key)
                        && !pending.contains(&key)
                        && !referenced.contains(&key)
                    {
                        state.remove_remote_document(&key);
                    }
                }
                Ok(())
            });
        match result {
            Ok(()) => Ok(()),
            Err(err) => ignore_if_primary_lease_loss(err),
        }
    }

    /// Runs `query` against the cache. With `use_previous_results` the target's
    /// last synced results seed the scan.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let inner = self.lock();
        let target = query.to_target();
        let cached = inner
            .target_ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| inner.target_data_by_target.get(target_id))
            .cloned();

        self.persistence.read("execute query", |state| {
            let target_data = cached.or_else(|| state.target_cache.get_target_data(&target).cloned());
            let (last_limbo_free, remote_keys) = match &target_data {
                Some(data) => (
                    data.last_limbo_free_snapshot_version,
                    state.target_cache.get_matching_keys_for_target_id(data.target_id),
                ),
                None => (SnapshotVersion::none(), BTreeSet::new()),
            };
            let (documents, strategy) = if use_previous_results {
                self.query_engine.get_documents_matching_query(
                    state,
                    &inner.documents_view,
                    query,
                    last_limbo_free,
                    &remote_keys,
                )
            } else {
                self.query_engine.get_documents_matching_query(
                    state,
                    &inner.documents_view,
                    query,
                    SnapshotVersion::none(),
                    &BTreeSet::new(),
                )
            };
            log::debug!(
                "query {} served by {strategy:?} with {} documents",
                query.canonical_id(),
                documents.len()
            );
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    /// Records which documents views now show and advances the limbo free
    /// version of targets whose snapshot is no longer from cache.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) {
        let mut inner = self.lock();
        let mut updated = Vec::new();
        for change in view_changes {
            let references = inner
                .local_view_references
                .entry(change.target_id)
                .or_default();
            references.extend(change.added_keys.iter().cloned());
            for key in &change.removed_keys {
                references.remove(key);
            }

            if change.from_cache {
                continue;
            }
            if let Some(target_data) = inner.target_data_by_target.get(&change.target_id) {
                let updated_data =
                    target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                inner
                    .target_data_by_target
                    .insert(change.target_id, updated_data.clone());
                updated.push(updated_data);
            }
        }
        drop(inner);

        if updated.is_empty() {
            return;
        }
        let result = self
            .persistence
            .run_transaction("notify local view changes", self.primary_mode(), |state| {
                for target_data in updated {
                    if state.target_cache.get_target_data_for_id(target_data.target_id).is_some() {
                        state.target_cache.update_target_data(target_data)?;
                    }
                }
                Ok(())
            });
        if let Err(err) = result {
            log::debug!("failed to persist limbo free snapshot versions: {err}");
        }
    }

    /// The first queued batch of the current user after `after_batch_id`.
    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let mut inner = self.lock();
        let user_id = inner.documents_view.user_id().to_string();
        let after = after_batch_id.unwrap_or(crate::firestore::model::BATCH_ID_UNKNOWN);
        let batch = self.persistence.read("next mutation batch", |state| {
            Ok(state
                .mutation_queue
                .get_next_mutation_batch_after_batch_id(&user_id, after)
                .cloned())
        })?;
        if let Some(batch) = &batch {
            inner.batch_keys.insert(batch.batch_id, batch.keys());
        }
        Ok(batch)
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let user_id = self.lock().documents_view.user_id().to_string();
        self.persistence.read("highest unacknowledged batch id", |state| {
            Ok(state.mutation_queue.get_highest_unacknowledged_batch_id(&user_id))
        })
    }

    pub fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let user_id = self.lock().documents_view.user_id().to_string();
        self.persistence
            .read("last stream token", |state| Ok(state.mutation_queue.last_stream_token(&user_id)))
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let user_id = self.lock().documents_view.user_id().to_string();
        self.persistence
            .run_transaction("set last stream token", self.primary_mode(), |state| {
                state.mutation_queue.set_last_stream_token(&user_id, stream_token);
                Ok(())
            })
    }

    /// Switches to `user`'s mutation queue and reports the documents whose local
    /// view may have changed.
    pub fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let mut inner = self.lock();
        let old_user_id = inner.documents_view.user_id().to_string();
        let new_view = LocalDocumentsView::new(user.key());

        let result = self.persistence.read("handle user change", |state| {
            let old_batches = state.mutation_queue.get_all_mutation_batches(&old_user_id);
            let new_batches = state.mutation_queue.get_all_mutation_batches(new_view.user_id());
            let changed_keys: BTreeSet<DocumentKey> = old_batches
                .iter()
                .chain(new_batches.iter())
                .flat_map(MutationBatch::keys)
                .collect();
            Ok(UserChangeResult {
                affected_documents: new_view.get_documents(state, &changed_keys),
                removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
            })
        })?;

        inner.user = user;
        inner.documents_view = new_view;
        Ok(result)
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let inner = self.lock();
        self.persistence
            .read("read document", |state| Ok(inner.documents_view.get_document(state, key)))
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence.read("remote document keys", |state| {
            Ok(state.target_cache.get_matching_keys_for_target_id(target_id))
        })
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.persistence.read("last remote snapshot version", |state| {
            Ok(state.target_cache.last_remote_snapshot_version())
        })
    }

    /// Target data of an active target, or what the cache holds for it.
    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let inner = self.lock();
        if let Some(data) = inner
            .target_ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| inner.target_data_by_target.get(target_id))
        {
            return Ok(Some(data.clone()));
        }
        self.persistence
            .read("get target data", |state| Ok(state.target_cache.get_target_data(target).cloned()))
    }

    /// The target behind `target_id`, which may have been allocated by another client.
    pub fn get_cached_target(&self, target_id: TargetId) -> FirestoreResult<Option<Target>> {
        if let Some(data) = self.lock().target_data_by_target.get(&target_id) {
            return Ok(Some(data.target.clone()));
        }
        self.persistence.read("get cached target", |state| {
            Ok(state
                .target_cache
                .get_target_data_for_id(target_id)
                .map(|data| data.target.clone()))
        })
    }

    /// Local views of the documents written by `batch_id`, or `None` when the
    /// batch is unknown to this client.
    pub fn lookup_mutation_documents(&self, batch_id: BatchId) -> FirestoreResult<Option<DocumentMap>> {
        let mut inner = self.lock();
        let cached = inner.batch_keys.get(&batch_id).cloned();
        let documents_view = inner.documents_view.clone();
        let (keys, documents) = self.persistence.read("lookup mutation documents", |state| {
            let keys = match cached {
                Some(keys) => Some(keys),
                None => state
                    .mutation_queue
                    .lookup_any_mutation_batch(batch_id)
                    .map(MutationBatch::keys),
            };
            let documents = keys
                .as_ref()
                .map(|keys| documents_view.get_documents(state, keys));
            Ok((keys, documents))
        })?;
        if let Some(keys) = keys {
            inner.batch_keys.insert(batch_id, keys);
        }
        Ok(documents)
    }

    pub fn remove_cached_mutation_batch_metadata(&self, batch_id: BatchId) {
        self.lock().batch_keys.remove(&batch_id);
    }

    /// Local views of documents another client wrote to the cache since the
    /// last call.
    pub fn get_new_document_changes(&self) -> FirestoreResult<DocumentMap> {
        let mut inner = self.lock();
        let since = inner.last_document_change_read_time;
        let documents_view = inner.documents_view.clone();
        let (documents, latest) = self.persistence.read("get new document changes", |state| {
            let changed = state.remote_documents.get_changes_since(since);
            let latest = changed
                .values()
                .map(MutableDocument::read_time)
                .max()
                .unwrap_or(since);
            Ok((documents_view.get_documents(state, changed.keys()), latest))
        })?;
        inner.last_document_change_read_time = latest;
        Ok(documents)
    }

    /// Replaces the configured field indexes and backfills new ones.
    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("configure field indexes", TransactionMode::ReadWrite, |state| {
                let PersistedState {
                    index_manager,
                    remote_documents,
                    ..
                } = state;
                index_manager.configure_field_indexes(indexes, remote_documents.iter());
                Ok(())
            })
    }

    /// Ids of the targets this client currently tracks.
    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        self.lock().target_data_by_target.keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, LocalStoreState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Whether an updated target must be written now. Writes are skipped while
/// only the resume token moves, unless the stored token is missing or old.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let age = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if age >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    !change.is_empty()
}

/// Writes the newer of each update into the remote cache. Returns the applied
/// documents and the keys whose existence flipped.
fn populate_document_changes(
    state: &mut PersistedState,
    updates: &BTreeMap<DocumentKey, MutableDocument>,
    remote_version: SnapshotVersion,
) -> FirestoreResult<(DocumentMap, BTreeSet<DocumentKey>)> {
    let mut changed = DocumentMap::new();
    let mut existence_changed = BTreeSet::new();

    for (key, document) in updates {
        let existing = state.remote_documents.get_entry(key);
        if document.is_found_document() != existing.is_found_document() {
            existence_changed.insert(key.clone());
        }

        // Deletes without a version come from rejected limbo resolutions and
        // must never add a document to the cache.
        if document.is_no_document() && document.version().is_none() {
            state.remove_remote_document(key);
            changed.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            let read_time = [document.read_time(), remote_version, document.version()]
                .into_iter()
                .find(|version| !version.is_none())
                .unwrap_or_default();
            state.set_remote_document(document.clone(), read_time)?;
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "ignoring outdated watch update for {key}: current version {}, watch version {}",
                existing.version(),
                document.version()
            );
        }
    }
    Ok((changed, existence_changed))
}
