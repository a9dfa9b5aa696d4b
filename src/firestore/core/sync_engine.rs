use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_lock::Mutex as AsyncMutex;
use futures::channel::oneshot;

use crate::firestore::core::query::Query;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{
    cancelled, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::{
    BatchState, DocumentMap, LocalStore, LocalViewChanges, QueryTargetState, ReferenceSet,
    SharedClientEvent, SharedClientState, TargetData, TargetId, TargetPurpose,
    ignore_if_primary_lease_loss, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatchResult, SnapshotVersion, User,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{
    box_remote_store_future, OnlineState, RemoteEvent, RemoteStore, RemoteStoreFuture,
    RemoteSyncer, TargetChange,
};

/// Receives what the sync engine produces for query listeners.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The backend rejected the query; it has been removed.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Where an online state change was observed. Secondary clients follow the
/// primary's online state rather than their own remote store's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}

/// Completion of a local write. Resolves once the backend acknowledged or
/// rejected the batch.
pub struct WriteCompletion {
    batch_id: BatchId,
    receiver: oneshot::Receiver<FirestoreResult<()>>,
}

impl WriteCompletion {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub async fn wait(self) -> FirestoreResult<()> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(cancelled("The client shut down before the write completed")))
    }
}

type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target reported the document. Its remote keys are
    /// empty until then.
    received_document: bool,
}

enum RemoteAction {
    Listen(TargetData),
    Unlisten(TargetId),
}

/// Work an operation leaves for after the state lock is released.
#[derive(Default)]
struct Effects {
    online_state: Option<OnlineState>,
    snapshots: Vec<ViewSnapshot>,
    errors: Vec<(Query, FirestoreError)>,
    remote: Vec<RemoteAction>,
    fill_write_pipeline: bool,
}

struct SyncEngineState {
    query_views_by_query: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views reference which limbo documents.
    limbo_document_refs: ReferenceSet,
    /// Write completions per user key.
    mutation_user_callbacks: BTreeMap<String, BTreeMap<BatchId, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    limbo_target_id_generator: TargetIdGenerator,
    current_user: User,
    /// `None` until the first primary state is applied.
    is_primary: Option<bool>,
    online_state: OnlineState,
}

impl SyncEngineState {
    fn is_primary_client(&self) -> bool {
        self.is_primary == Some(true)
    }
}

/// Ties the local store, the remote store and the views of active queries
/// together. Tracks limbo documents and resolves them with single document
/// listens, and routes write results back to their writers.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    shared_client_state: Arc<dyn SharedClientState>,
    max_concurrent_limbo_resolutions: usize,
    listener: Mutex<Option<Weak<dyn SyncEngineListener>>>,
    /// Serializes operations. The state lock itself is never held across an
    /// await.
    ops: AsyncMutex<()>,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        shared_client_state: Arc<dyn SharedClientState>,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            local_store,
            remote_store: remote_store.clone(),
            shared_client_state,
            max_concurrent_limbo_resolutions,
            listener: Mutex::new(None),
            ops: AsyncMutex::new(()),
            state: Mutex::new(SyncEngineState {
                query_views_by_query: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                mutation_user_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                current_user,
                is_primary: None,
                online_state: OnlineState::Unknown,
            }),
        });
        let syncer: Arc<dyn RemoteSyncer> = engine.clone();
        remote_store.set_syncer(Arc::downgrade(&syncer));
        engine
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }

    pub fn is_primary_client(&self) -> bool {
        self.lock().is_primary_client()
    }

    pub fn current_user(&self) -> User {
        self.lock().current_user.clone()
    }

    /// Keys of documents currently waiting for or undergoing limbo resolution.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.lock().active_limbo_targets_by_key.clone()
    }

    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.lock().enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Starts tracking `query` and returns its first snapshot. Queries sharing
    /// a target share its listen.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let _guard = self.ops.lock().await;
        let mut effects = Effects::default();
        let result = self.run_locked(&mut effects, |state, effects| {
            self.listen_locked(state, effects, query)
        });
        self.flush(effects).await;
        result
    }

    pub async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let _guard = self.ops.lock().await;
        let mut effects = Effects::default();
        let result = self.run_locked(&mut effects, |state, effects| {
            self.unlisten_locked(state, effects, query)
        });
        self.flush(effects).await;
        result
    }

    /// Applies `mutations` locally and queues them for the backend.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        let _guard = self.ops.lock().await;
        let mut effects = Effects::default();
        let result = self.run_locked(&mut effects, |state, effects| {
            self.write_locked(state, effects, mutations)
        });
        self.flush(effects).await;
        result
    }

    /// Resolves once every write queued so far was acknowledged or rejected.
    /// Fails when the user changes in the meantime.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let receiver = {
            let _guard = self.ops.lock().await;
            if !self.remote_store.can_use_network().await {
                log::debug!("the network is disabled, pending writes complete once it is enabled again");
            }
            let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id()?;
            if highest_batch_id == BATCH_ID_UNKNOWN {
                return Ok(());
            }
            let (sender, receiver) = oneshot::channel();
            self.lock()
                .pending_writes_callbacks
                .entry(highest_batch_id)
                .or_default()
                .push(sender);
            receiver
        };
        receiver
            .await
            .unwrap_or_else(|_| Err(cancelled("The client shut down before pending writes completed")))
    }

    pub fn apply_online_state_change_from(&self, online_state: OnlineState, source: OnlineStateSource) {
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            let is_primary = state.is_primary_client();
            let applies = (is_primary && source == OnlineStateSource::RemoteStore)
                || (!is_primary && source == OnlineStateSource::SharedClientState);
            if !applies {
                return;
            }
            for query_view in state.query_views_by_query.values_mut() {
                if let Some(snapshot) = query_view.view.apply_online_state_change(online_state).snapshot {
                    effects.snapshots.push(snapshot);
                }
            }
            state.online_state = online_state;
            effects.online_state = Some(online_state);
            if is_primary {
                self.shared_client_state.set_online_state(online_state);
            }
        }
        self.notify_listener(&mut effects);
    }

    /// Switches between primary and secondary. A new primary reconciles its
    /// views with persistence and takes over every active target; a former
    /// primary drops what no local listener needs.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let _guard = self.ops.lock().await;
        let current = self.lock().is_primary;
        let mut effects = Effects::default();

        if is_primary && current != Some(true) {
            let result = self.run_locked(&mut effects, |state, effects| {
                let active_targets = self.shared_client_state.get_all_active_query_targets();
                let active_queries =
                    self.synchronize_query_views_and_raise_snapshots(state, effects, active_targets, true)?;
                state.is_primary = Some(true);
                Ok(active_queries)
            });
            self.flush(effects).await;
            let active_queries = result?;
            log::debug!("client became primary with {} active targets", active_queries.len());
            self.remote_store.apply_primary_state(true).await?;
            for target_data in active_queries {
                self.remote_store.listen(target_data).await;
            }
        } else if !is_primary && current != Some(false) {
            let result = self.run_locked(&mut effects, |state, effects| {
                let mut active_targets = BTreeSet::new();
                let target_ids: Vec<TargetId> = state.queries_by_target.keys().copied().collect();
                for target_id in target_ids {
                    if self.shared_client_state.is_local_query_target(target_id) {
                        active_targets.insert(target_id);
                    } else {
                        self.remove_and_cleanup_target(state, effects, target_id, None);
                        self.local_store.release_target(target_id, true)?;
                    }
                    effects.remote.push(RemoteAction::Unlisten(target_id));
                }
                self.synchronize_query_views_and_raise_snapshots(state, effects, active_targets, false)?;
                self.reset_limbo_documents(state, effects);
                state.is_primary = Some(false);
                Ok(())
            });
            self.flush(effects).await;
            result?;
            log::debug!("client is now secondary");
            self.remote_store.apply_primary_state(false).await?;
        }
        Ok(())
    }

    /// Another client changed the state of a batch this client may show.
    pub async fn apply_batch_state(
        &self,
        batch_id: BatchId,
        batch_state: BatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let _guard = self.ops.lock().await;
        let mut effects = Effects::default();
        let result = self.run_locked(&mut effects, |state, effects| {
            self.apply_batch_state_locked(state, effects, batch_id, batch_state, error)
        });
        self.flush(effects).await;
        result
    }

    /// The primary reported a new state for a target this secondary listens to.
    pub async fn apply_target_state(
        &self,
        target_id: TargetId,
        target_state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let _guard = self.ops.lock().await;
        let mut effects = Effects::default();
        let result = self.run_locked(&mut effects, |state, effects| {
            self.apply_target_state_locked(state, effects, target_id, target_state, error)
        });
        self.flush(effects).await;
        result
    }

    /// Targets started or stopped being listened to by any client. Only the
    /// primary acts on this.
    pub async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()> {
        let _guard = self.ops.lock().await;
        let mut effects = Effects::default();
        let result = self.run_locked(&mut effects, |state, effects| {
            self.apply_active_targets_change_locked(state, effects, added, removed)
        });
        self.flush(effects).await;
        result
    }

    /// Dispatches one event received from another client.
    pub async fn apply_shared_client_event(&self, event: SharedClientEvent) -> FirestoreResult<()> {
        match event {
            SharedClientEvent::BatchState { batch_id, state, error } => {
                self.apply_batch_state(batch_id, state, error).await
            }
            SharedClientEvent::TargetState { target_id, state, error } => {
                self.apply_target_state(target_id, state, error).await
            }
            SharedClientEvent::ActiveTargetsChange { added, removed } => {
                self.apply_active_targets_change(added, removed).await
            }
            SharedClientEvent::OnlineState(online_state) => {
                self.apply_online_state_change_from(online_state, OnlineStateSource::SharedClientState);
                Ok(())
            }
        }
    }

    fn listen_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        query: Query,
    ) -> FirestoreResult<ViewSnapshot> {
        if let Some(query_view) = state.query_views_by_query.get(&query.canonical_id()) {
            self.shared_client_state
                .add_local_query_target(query_view.target_id, true);
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let status = self
            .shared_client_state
            .add_local_query_target(target_data.target_id, true);
        let snapshot = self.initialize_view_and_compute_snapshot(
            state,
            effects,
            query,
            target_data.target_id,
            status == QueryTargetState::Current,
            target_data.resume_token.clone(),
        )?;
        if state.is_primary_client() {
            effects.remote.push(RemoteAction::Listen(target_data));
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        query: Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let synthesized = TargetChange::create_synthesized_target_change_for_current_change(
            current && state.online_state != OnlineState::Offline,
            resume_token,
        );
        let view_change = view.apply_changes(
            doc_changes,
            state.is_primary_client(),
            Some(&synthesized),
            false,
        );
        self.update_tracked_limbos(state, effects, target_id, view_change.limbo_changes);
        let snapshot = view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot());

        state.query_views_by_query.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state.queries_by_target.entry(target_id).or_default().push(query);
        Ok(snapshot)
    }

    fn unlisten_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        query: &Query,
    ) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(target_id) = state
            .query_views_by_query
            .get(&canonical_id)
            .map(|query_view| query_view.target_id)
        else {
            log::debug!("ignoring unlisten of unknown query {canonical_id}");
            return Ok(());
        };

        if let Some(queries) = state.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|existing| existing.canonical_id() != canonical_id);
                state.query_views_by_query.remove(&canonical_id);
                return Ok(());
            }
        }

        if state.is_primary_client() {
            // Removed first so that only other clients' interest keeps the target.
            self.shared_client_state.remove_local_query_target(target_id);
            if !self.shared_client_state.is_active_query_target(target_id) {
                match self.local_store.release_target(target_id, false) {
                    Ok(()) => {
                        self.shared_client_state.clear_query_state(target_id);
                        effects.remote.push(RemoteAction::Unlisten(target_id));
                        self.remove_and_cleanup_target(state, effects, target_id, None);
                    }
                    Err(err) => ignore_if_primary_lease_loss(err)?,
                }
            }
        } else {
            self.remove_and_cleanup_target(state, effects, target_id, None);
            self.local_store.release_target(target_id, true)?;
        }
        Ok(())
    }

    fn write_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<WriteCompletion> {
        let result = self.local_store.write_locally(mutations)?;
        self.shared_client_state.add_pending_mutation(result.batch_id);

        let (sender, receiver) = oneshot::channel();
        state
            .mutation_user_callbacks
            .entry(state.current_user.key().to_string())
            .or_default()
            .insert(result.batch_id, sender);

        self.emit_new_snaps_and_notify_local_store(state, effects, &result.changes, None)?;
        effects.fill_write_pipeline = true;
        Ok(WriteCompletion {
            batch_id: result.batch_id,
            receiver,
        })
    }

    fn apply_remote_event_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        event: &RemoteEvent,
    ) -> FirestoreResult<()> {
        let changes = match self.local_store.apply_remote_event(event) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(err),
        };

        for (target_id, change) in &event.target_changes {
            let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let change_count = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if change_count > 1 {
                return Err(internal_error(
                    "Limbo resolution for single document contains multiple changes.",
                ));
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error(
                        "Received change for limbo target document without add.",
                    ));
                }
            } else if !change.removed_documents.is_empty() {
                if !resolution.received_document {
                    return Err(internal_error(
                        "Received remove for limbo target document without add.",
                    ));
                }
                resolution.received_document = false;
            }
        }

        self.emit_new_snaps_and_notify_local_store(state, effects, &changes, Some(event))
            .or_else(ignore_if_primary_lease_loss)
    }

    fn reject_listen_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        target_id: TargetId,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let limbo_key = state
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());
        let Some(limbo_key) = limbo_key else {
            self.shared_client_state
                .update_query_state(target_id, QueryTargetState::Rejected, Some(&error));
            return match self.local_store.release_target(target_id, false) {
                Ok(()) => {
                    self.remove_and_cleanup_target(state, effects, target_id, Some(error));
                    Ok(())
                }
                Err(err) => ignore_if_primary_lease_loss(err),
            };
        };

        // A rejected limbo listen means the document cannot be read: treat it
        // as deleted. Bookkeeping is only cleared once that was applied.
        log::debug!("limbo resolution for {limbo_key} was rejected: {error}");
        let mut event = RemoteEvent::default();
        event.document_updates.insert(
            limbo_key.clone(),
            MutableDocument::new_no_document(limbo_key.clone(), SnapshotVersion::none()),
        );
        event.resolved_limbo_documents.insert(limbo_key.clone());
        self.apply_remote_event_locked(state, effects, &event)?;

        state.active_limbo_targets_by_key.remove(&limbo_key);
        state.active_limbo_resolutions_by_target.remove(&target_id);
        self.pump_enqueued_limbo_resolutions(state, effects);
        Ok(())
    }

    fn apply_successful_write_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        result: MutationBatchResult,
    ) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = match self.local_store.acknowledge_batch(&result) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(err),
        };
        // Writers hear about the commit before listeners see its effect.
        self.process_user_callback(state, batch_id, None);
        self.trigger_pending_writes_callbacks(state, batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, BatchState::Acknowledged, None);
        self.emit_new_snaps_and_notify_local_store(state, effects, &changes, None)
            .or_else(ignore_if_primary_lease_loss)
    }

    fn reject_failed_write_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let changes = match self.local_store.reject_batch(batch_id) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(err),
        };
        log::warn!("write batch {batch_id} was rejected: {error}");
        self.process_user_callback(state, batch_id, Some(error.clone()));
        self.trigger_pending_writes_callbacks(state, batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, BatchState::Rejected, Some(&error));
        self.emit_new_snaps_and_notify_local_store(state, effects, &changes, None)
            .or_else(ignore_if_primary_lease_loss)
    }

    fn handle_credential_change_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        user: User,
    ) -> FirestoreResult<()> {
        if state.current_user == user {
            return Ok(());
        }
        log::debug!("user change, new user: {user}");
        let result = self.local_store.handle_user_change(user.clone())?;
        state.current_user = user.clone();

        for (_, callbacks) in std::mem::take(&mut state.pending_writes_callbacks) {
            for callback in callbacks {
                let _ = callback.send(Err(cancelled(
                    "'wait_for_pending_writes' was rejected due to a user change.",
                )));
            }
        }
        self.shared_client_state.handle_user_change(
            &user,
            &result.removed_batch_ids,
            &result.added_batch_ids,
        );
        self.emit_new_snaps_and_notify_local_store(state, effects, &result.affected_documents, None)
    }

    fn apply_batch_state_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        batch_id: BatchId,
        batch_state: BatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let Some(documents) = self.local_store.lookup_mutation_documents(batch_id)? else {
            log::debug!("cannot apply mutation batch with id {batch_id}");
            return Ok(());
        };

        match batch_state {
            // Another client queued a write: the primary sends it.
            BatchState::Pending => effects.fill_write_pipeline = true,
            BatchState::Acknowledged | BatchState::Rejected => {
                self.process_user_callback(state, batch_id, error);
                self.trigger_pending_writes_callbacks(state, batch_id);
                self.local_store.remove_cached_mutation_batch_metadata(batch_id);
            }
        }
        self.emit_new_snaps_and_notify_local_store(state, effects, &documents, None)
    }

    fn apply_target_state_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        target_id: TargetId,
        target_state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        if state.is_primary_client() {
            log::debug!("ignoring unexpected query state notification for target {target_id}");
            return Ok(());
        }
        if !state
            .queries_by_target
            .get(&target_id)
            .is_some_and(|queries| !queries.is_empty())
        {
            return Ok(());
        }

        match target_state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let changes = self.local_store.get_new_document_changes()?;
                let event = RemoteEvent::create_synthesized_remote_event_for_current_change(
                    target_id,
                    target_state == QueryTargetState::Current,
                    Vec::new(),
                );
                self.emit_new_snaps_and_notify_local_store(state, effects, &changes, Some(&event))
            }
            QueryTargetState::Rejected => {
                self.local_store.release_target(target_id, true)?;
                let error = error.unwrap_or_else(|| {
                    FirestoreError::new(
                        FirestoreErrorCode::Unknown,
                        format!("Listen for target {target_id} was rejected"),
                    )
                });
                self.remove_and_cleanup_target(state, effects, target_id, Some(error));
                Ok(())
            }
        }
    }

    fn apply_active_targets_change_locked(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()> {
        if !state.is_primary_client() {
            return Ok(());
        }

        for target_id in added {
            if state.queries_by_target.contains_key(&target_id) {
                log::debug!("adding an already active target {target_id}");
                continue;
            }
            let Some(target) = self.local_store.get_cached_target(target_id)? else {
                log::debug!("active target {target_id} is not in the target cache");
                continue;
            };
            let target_data = self.local_store.allocate_target(target.clone())?;
            self.initialize_view_and_compute_snapshot(
                state,
                effects,
                Query::from_target(&target),
                target_data.target_id,
                false,
                target_data.resume_token.clone(),
            )?;
            effects.remote.push(RemoteAction::Listen(target_data));
        }

        for target_id in removed {
            // Rejected targets are already gone.
            if !state.queries_by_target.contains_key(&target_id) {
                continue;
            }
            match self.local_store.release_target(target_id, false) {
                Ok(()) => {
                    effects.remote.push(RemoteAction::Unlisten(target_id));
                    self.remove_and_cleanup_target(state, effects, target_id, None);
                }
                Err(err) => ignore_if_primary_lease_loss(err)?,
            }
        }
        Ok(())
    }

    /// Brings the views of `targets` in line with persistence, creating views
    /// for targets only other clients listened to. Limbo documents are only
    /// tracked when `transition_to_primary` is set. Returns their target data.
    fn synchronize_query_views_and_raise_snapshots(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        targets: BTreeSet<TargetId>,
        transition_to_primary: bool,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active_queries = Vec::new();
        for target_id in targets {
            let queries = state
                .queries_by_target
                .get(&target_id)
                .cloned()
                .unwrap_or_default();

            let target_data = if let Some(first) = queries.first() {
                // Resume token and synced documents may have moved on while
                // another client was primary.
                let target_data = self.local_store.allocate_target(first.to_target())?;
                for query in &queries {
                    let Some(query_view) = state.query_views_by_query.get_mut(&query.canonical_id()) else {
                        continue;
                    };
                    let query_result = self.local_store.execute_query(&query_view.query, true)?;
                    let view_change = query_view.view.synchronize_with_persisted_state(query_result);
                    let view_target_id = query_view.target_id;
                    if transition_to_primary {
                        self.update_tracked_limbos(state, effects, view_target_id, view_change.limbo_changes);
                    }
                    if let Some(snapshot) = view_change.snapshot {
                        effects.snapshots.push(snapshot);
                    }
                }
                target_data
            } else {
                let Some(target) = self.local_store.get_cached_target(target_id)? else {
                    log::debug!("active target {target_id} is not in the target cache");
                    continue;
                };
                let target_data = self.local_store.allocate_target(target.clone())?;
                self.initialize_view_and_compute_snapshot(
                    state,
                    effects,
                    Query::from_target(&target),
                    target_id,
                    false,
                    target_data.resume_token.clone(),
                )?;
                target_data
            };
            active_queries.push(target_data);
        }
        Ok(active_queries)
    }

    fn reset_limbo_documents(&self, state: &mut SyncEngineState, effects: &mut Effects) {
        for target_id in state.active_limbo_resolutions_by_target.keys() {
            effects.remote.push(RemoteAction::Unlisten(*target_id));
        }
        state.limbo_document_refs.remove_all_references();
        state.active_limbo_resolutions_by_target.clear();
        state.active_limbo_targets_by_key.clear();
        state.enqueued_limbo_resolutions.clear();
    }

    fn remove_and_cleanup_target(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) {
        self.shared_client_state.remove_local_query_target(target_id);
        for query in state.queries_by_target.remove(&target_id).unwrap_or_default() {
            state.query_views_by_query.remove(&query.canonical_id());
            if let Some(error) = &error {
                effects.errors.push((query, error.clone()));
            }
        }

        if state.is_primary_client() {
            let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
            for key in limbo_keys {
                if !state.limbo_document_refs.contains_key(&key) {
                    self.remove_limbo_target(state, effects, &key);
                }
            }
        }
    }

    fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(state, effects, key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document no longer in limbo: {key}");
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(state, effects, &key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&self, state: &mut SyncEngineState, effects: &mut Effects, key: DocumentKey) {
        if state.active_limbo_targets_by_key.contains_key(&key)
            || state.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("new document in limbo: {key}");
        state.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(state, effects);
    }

    /// Starts queued limbo resolutions while slots are free.
    fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState, effects: &mut Effects) {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = state.limbo_target_id_generator.next();
            state.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state
                .active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            effects.remote.push(RemoteAction::Listen(TargetData::new(
                Query::document(&key).to_target(),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&self, state: &mut SyncEngineState, effects: &mut Effects, key: &DocumentKey) {
        state.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(limbo_target_id) = state.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        effects.remote.push(RemoteAction::Unlisten(limbo_target_id));
        state.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions(state, effects);
    }

    fn process_user_callback(&self, state: &mut SyncEngineState, batch_id: BatchId, error: Option<FirestoreError>) {
        let Some(callbacks) = state
            .mutation_user_callbacks
            .get_mut(state.current_user.key())
        else {
            return;
        };
        if let Some(callback) = callbacks.remove(&batch_id) {
            let _ = callback.send(error.map_or(Ok(()), Err));
        }
    }

    fn trigger_pending_writes_callbacks(&self, state: &mut SyncEngineState, batch_id: BatchId) {
        for callback in state.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    /// Runs `changes` through every view, raises the resulting snapshots and
    /// reports which documents the views now hold.
    fn emit_new_snaps_and_notify_local_store(
        &self,
        state: &mut SyncEngineState,
        effects: &mut Effects,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        if state.query_views_by_query.is_empty() {
            return Ok(());
        }

        let is_primary = state.is_primary_client();
        let mut doc_changes_in_all_views = Vec::new();
        let canonical_ids: Vec<String> = state.query_views_by_query.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some(query_view) = state.query_views_by_query.get_mut(&canonical_id) else {
                continue;
            };
            let target_id = query_view.target_id;

            let mut view_doc_changes = query_view.view.compute_doc_changes(changes, None);
            if view_doc_changes.needs_refill {
                // Documents past the limit may now belong in the view.
                let query_result = self.local_store.execute_query(&query_view.query, false)?;
                view_doc_changes = query_view
                    .view
                    .compute_doc_changes(&query_result.documents, Some(view_doc_changes));
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let target_is_pending_reset =
                remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change = query_view.view.apply_changes(
                view_doc_changes,
                is_primary,
                target_change,
                target_is_pending_reset,
            );
            self.update_tracked_limbos(state, effects, target_id, view_change.limbo_changes);

            let snapshot = view_change.snapshot;
            if is_primary && (snapshot.is_some() || remote_event.is_some()) {
                let is_current = match &snapshot {
                    Some(snapshot) => !snapshot.from_cache,
                    None => target_change.is_some_and(|change| change.current),
                };
                let query_state = if is_current {
                    QueryTargetState::Current
                } else {
                    QueryTargetState::NotCurrent
                };
                self.shared_client_state
                    .update_query_state(target_id, query_state, None);
            }
            if let Some(snapshot) = snapshot {
                doc_changes_in_all_views.push(local_view_changes(target_id, &snapshot));
                effects.snapshots.push(snapshot);
            }
        }

        self.local_store
            .notify_local_view_changes(&doc_changes_in_all_views);
        Ok(())
    }

    fn run_locked<T>(
        &self,
        effects: &mut Effects,
        f: impl FnOnce(&mut SyncEngineState, &mut Effects) -> T,
    ) -> T {
        let mut state = self.lock();
        f(&mut state, effects)
    }

    fn notify_listener(&self, effects: &mut Effects) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade);
        let Some(listener) = listener else {
            return;
        };
        if let Some(online_state) = effects.online_state.take() {
            listener.on_online_state_change(online_state);
        }
        let snapshots = std::mem::take(&mut effects.snapshots);
        if !snapshots.is_empty() {
            listener.on_watch_change(snapshots);
        }
        for (query, error) in effects.errors.drain(..) {
            listener.on_watch_error(&query, error);
        }
    }

    async fn flush(&self, mut effects: Effects) {
        self.notify_listener(&mut effects);
        for action in effects.remote {
            match action {
                RemoteAction::Listen(target_data) => self.remote_store.listen(target_data).await,
                RemoteAction::Unlisten(target_id) => self.remote_store.unlisten(target_id).await,
            }
        }
        if effects.fill_write_pipeline {
            if let Err(err) = self.remote_store.fill_write_pipeline().await {
                log::warn!("failed to fill the write pipeline: {err}");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let _guard = self.ops.lock().await;
            let mut effects = Effects::default();
            let result = self.run_locked(&mut effects, |state, effects| {
                self.apply_remote_event_locked(state, effects, &event)
            });
            self.flush(effects).await;
            result
        })
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let _guard = self.ops.lock().await;
            let mut effects = Effects::default();
            let result = self.run_locked(&mut effects, |state, effects| {
                self.reject_listen_locked(state, effects, target_id, error)
            });
            self.flush(effects).await;
            result
        })
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let _guard = self.ops.lock().await;
            let mut effects = Effects::default();
            let outcome = self.run_locked(&mut effects, |state, effects| {
                self.apply_successful_write_locked(state, effects, result)
            });
            self.flush(effects).await;
            outcome
        })
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let _guard = self.ops.lock().await;
            let mut effects = Effects::default();
            let result = self.run_locked(&mut effects, |state, effects| {
                self.reject_failed_write_locked(state, effects, batch_id, error)
            });
            self.flush(effects).await;
            result
        })
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.lock();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return BTreeSet::from([resolution.key.clone()]);
            }
        }
        let keys = state
            .queries_by_target
            .get(&target_id)
            .into_iter()
            .flatten()
            .filter_map(|query| state.query_views_by_query.get(&query.canonical_id()))
            .flat_map(|query_view| query_view.view.synced_documents().iter().cloned())
            .collect();
        keys
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        self.apply_online_state_change_from(online_state, OnlineStateSource::RemoteStore);
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let _guard = self.ops.lock().await;
            let mut effects = Effects::default();
            let result = self.run_locked(&mut effects, |state, effects| {
                self.handle_credential_change_locked(state, effects, user)
            });
            self.flush(effects).await;
            result
        })
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let keys_of = |change_type: ChangeType| -> BTreeSet<DocumentKey> {
        snapshot
            .doc_changes
            .iter()
            .filter(|change| change.change_type == change_type)
            .map(|change| change.doc.key().clone())
            .collect()
    };
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys: keys_of(ChangeType::Added),
        removed_keys: keys_of(ChangeType::Removed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::{MemorySharedClientState, Persistence};
    use crate::firestore::model::{DatabaseId, FieldPath, MutationResult, ResourcePath};
    use crate::firestore::remote::InMemoryDatastore;
    use crate::util::backoff::BackoffSettings;
    use crate::firestore::value::{FirestoreValue, MapValue};

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<(Query, FirestoreError)>>,
        online_states: Mutex<Vec<OnlineState>>,
    }

    impl RecordingListener {
        fn take_snapshots(&self) -> Vec<ViewSnapshot> {
            std::mem::take(&mut *self.snapshots.lock().unwrap())
        }
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push((query.clone(), error));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        remote_store: RemoteStore,
        local_store: Arc<LocalStore>,
        listener: Arc<RecordingListener>,
        _datastore: InMemoryDatastore,
    }

    async fn harness(is_primary: bool, max_limbo_resolutions: usize) -> Harness {
        let local_store = Arc::new(LocalStore::new(
            Persistence::memory(),
            User::unauthenticated(),
            None,
        ));
        local_store.start().unwrap();
        let datastore = InMemoryDatastore::new();
        let remote_store = RemoteStore::new(
            DatabaseId::default_database("test"),
            Arc::new(datastore.clone()),
            Arc::clone(&local_store),
            BackoffSettings::default(),
        );
        let engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            Arc::new(MemorySharedClientState::new()),
            User::unauthenticated(),
            max_limbo_resolutions,
        );
        let listener = Arc::new(RecordingListener::default());
        let dyn_listener: Arc<dyn SyncEngineListener> = listener.clone();
        engine.set_listener(Arc::downgrade(&dyn_listener));
        engine.apply_primary_state(is_primary).await.unwrap();
        Harness {
            engine,
            remote_store,
            local_store,
            listener,
            _datastore: datastore,
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, micros: i64) -> MutableDocument {
        let mut map = MapValue::empty();
        map.set(
            &FieldPath::from_dot_separated("n").unwrap(),
            FirestoreValue::from_integer(1),
        );
        MutableDocument::new_found(key(path), SnapshotVersion::from_micros(micros), map)
    }

    fn rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap())
    }

    fn current_event(target_id: TargetId, docs: &[&str], micros: i64) -> RemoteEvent {
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(micros),
            ..RemoteEvent::default()
        };
        let mut change = TargetChange {
            resume_token: format!("token-{micros}").into_bytes(),
            current: true,
            ..TargetChange::default()
        };
        for path in docs {
            change.added_documents.insert(key(path));
            event.document_updates.insert(key(path), doc(path, micros));
        }
        event.target_changes.insert(target_id, change);
        event
    }

    fn removal_event(target_id: TargetId, docs: &[&str], micros: i64) -> RemoteEvent {
        let mut change = TargetChange {
            current: true,
            ..TargetChange::default()
        };
        change
            .removed_documents
            .extend(docs.iter().map(|path| key(path)));
        RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(micros),
            target_changes: BTreeMap::from([(target_id, change)]),
            ..RemoteEvent::default()
        }
    }

    async fn listen_to_rooms(harness: &Harness) -> TargetId {
        let snapshot = harness.engine.listen(rooms()).await.unwrap();
        assert!(snapshot.from_cache);
        harness
            .local_store
            .get_target_data(&rooms().to_target())
            .unwrap()
            .unwrap()
            .target_id
    }

    #[tokio::test]
    async fn remote_events_raise_synced_snapshots() {
        let harness = harness(true, 100).await;
        let target_id = listen_to_rooms(&harness).await;
        assert!(harness.remote_store.is_listening(target_id).await);

        harness
            .engine
            .apply_remote_event(current_event(target_id, &["rooms/a"], 10))
            .await
            .unwrap();

        let snapshots = harness.listener.take_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].from_cache);
        assert_eq!(snapshots[0].docs.len(), 1);
        assert_eq!(snapshots[0].doc_changes[0].change_type, ChangeType::Added);
    }

    #[tokio::test]
    async fn secondary_clients_do_not_listen_remotely() {
        let harness = harness(false, 100).await;
        let target_id = listen_to_rooms(&harness).await;
        assert!(!harness.remote_store.is_listening(target_id).await);
        assert!(!harness.engine.is_primary_client());
    }

    #[tokio::test]
    async fn limbo_resolutions_respect_the_concurrency_cap() {
        let harness = harness(true, 1).await;
        let target_id = listen_to_rooms(&harness).await;
        harness
            .engine
            .apply_remote_event(current_event(target_id, &["rooms/a", "rooms/b", "rooms/c"], 10))
            .await
            .unwrap();

        // The backend stops reporting b and c without deleting them.
        harness
            .engine
            .apply_remote_event(removal_event(target_id, &["rooms/b", "rooms/c"], 20))
            .await
            .unwrap();

        let active = harness.engine.active_limbo_document_resolutions();
        assert_eq!(active.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
        let limbo_target_id = active[&key("rooms/b")];
        assert_eq!(limbo_target_id % 2, 1);
        assert!(harness.remote_store.is_listening(limbo_target_id).await);
        assert_eq!(
            harness.engine.enqueued_limbo_document_resolutions(),
            vec![key("rooms/c")]
        );
        let last = harness.listener.take_snapshots().pop().unwrap();
        assert!(last.from_cache);

        // A rejected limbo listen counts as a delete and frees the slot.
        harness
            .engine
            .reject_listen(
                limbo_target_id,
                FirestoreError::new(FirestoreErrorCode::PermissionDenied, "denied"),
            )
            .await
            .unwrap();

        let active = harness.engine.active_limbo_document_resolutions();
        assert_eq!(active.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/c")]);
        assert!(harness.engine.enqueued_limbo_document_resolutions().is_empty());
        assert!(!harness.remote_store.is_listening(limbo_target_id).await);
        let last = harness.listener.take_snapshots().pop().unwrap();
        assert!(last.docs.get(&key("rooms/b")).is_none());
    }

    #[tokio::test]
    async fn rejected_listens_surface_as_query_errors() {
        let harness = harness(true, 100).await;
        let target_id = listen_to_rooms(&harness).await;

        harness
            .engine
            .reject_listen(
                target_id,
                FirestoreError::new(FirestoreErrorCode::PermissionDenied, "denied"),
            )
            .await
            .unwrap();

        let errors = harness.listener.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, rooms());
        assert_eq!(errors[0].1.code, FirestoreErrorCode::PermissionDenied);
        assert!(harness.engine.get_remote_keys_for_target(target_id).is_empty());
    }

    #[tokio::test]
    async fn write_completion_follows_the_backend_result() {
        let harness = harness(false, 100).await;
        listen_to_rooms(&harness).await;

        let first = harness
            .engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())])
            .await
            .unwrap();
        let snapshot = harness.listener.take_snapshots().pop().unwrap();
        assert!(snapshot.has_pending_writes());

        let second = harness
            .engine
            .write(vec![Mutation::set(key("rooms/b"), MapValue::empty())])
            .await
            .unwrap();

        let batch = harness.local_store.next_mutation_batch(None).unwrap().unwrap();
        assert_eq!(batch.batch_id, first.batch_id());
        let result = MutationBatchResult::from(
            batch,
            SnapshotVersion::from_micros(5),
            vec![MutationResult::new(SnapshotVersion::from_micros(5))],
            Vec::new(),
        )
        .unwrap();
        harness.engine.apply_successful_write(result).await.unwrap();
        first.wait().await.unwrap();

        harness
            .engine
            .reject_failed_write(
                second.batch_id(),
                FirestoreError::new(FirestoreErrorCode::InvalidArgument, "bad"),
            )
            .await
            .unwrap();
        let error = second.wait().await.unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::InvalidArgument);
        let snapshot = harness.listener.take_snapshots().pop().unwrap();
        assert!(snapshot.docs.get(&key("rooms/b")).is_none());
    }

    #[tokio::test]
    async fn pending_write_waits_are_cancelled_by_a_user_change() {
        let harness = harness(false, 100).await;
        harness.engine.wait_for_pending_writes().await.unwrap();

        harness
            .engine
            .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())])
            .await
            .unwrap();
        let (waited, changed) = futures::join!(
            harness.engine.wait_for_pending_writes(),
            harness.engine.handle_credential_change(User::new("bob"))
        );
        changed.unwrap();
        assert_eq!(waited.unwrap_err().code, FirestoreErrorCode::Cancelled);
        assert_eq!(harness.engine.current_user(), User::new("bob"));
    }

    #[tokio::test]
    async fn online_state_applies_only_from_the_owning_source() {
        let harness = harness(true, 100).await;
        let target_id = listen_to_rooms(&harness).await;
        harness
            .engine
            .apply_remote_event(current_event(target_id, &["rooms/a"], 10))
            .await
            .unwrap();
        harness.listener.take_snapshots();

        harness
            .engine
            .apply_online_state_change_from(OnlineState::Offline, OnlineStateSource::SharedClientState);
        assert!(!harness
            .listener
            .online_states
            .lock()
            .unwrap()
            .contains(&OnlineState::Offline));

        RemoteSyncer::apply_online_state_change(harness.engine.as_ref(), OnlineState::Offline);
        assert_eq!(
            harness.listener.online_states.lock().unwrap().last(),
            Some(&OnlineState::Offline)
        );
        let snapshot = harness.listener.take_snapshots().pop().unwrap();
        assert!(snapshot.from_cache);
    }

    #[tokio::test]
    async fn a_new_primary_takes_over_active_targets() {
        let harness = harness(false, 100).await;
        let target_id = listen_to_rooms(&harness).await;
        assert!(!harness.remote_store.is_listening(target_id).await);

        harness.engine.apply_primary_state(true).await.unwrap();
        assert!(harness.engine.is_primary_client());
        assert!(harness.remote_store.is_listening(target_id).await);

        harness.engine.apply_primary_state(false).await.unwrap();
        assert!(!harness.remote_store.is_listening(target_id).await);
        // The local listener keeps its view.
        harness.engine.unlisten(&rooms()).await.unwrap();
    }

    #[tokio::test]
    async fn a_new_primary_resolves_limbo_documents_of_its_views() {
        let harness = harness(false, 100).await;
        let target_id = listen_to_rooms(&harness).await;
        harness
            .engine
            .apply_remote_event(current_event(target_id, &["rooms/a", "rooms/b"], 10))
            .await
            .unwrap();
        harness
            .engine
            .apply_remote_event(removal_event(target_id, &["rooms/b"], 20))
            .await
            .unwrap();
        // Secondaries leave limbo resolution to the primary.
        assert!(harness.engine.active_limbo_document_resolutions().is_empty());

        harness.engine.apply_primary_state(true).await.unwrap();
        let active = harness.engine.active_limbo_document_resolutions();
        assert_eq!(active.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
        assert!(harness.remote_store.is_listening(active[&key("rooms/b")]).await);

        harness.engine.apply_primary_state(false).await.unwrap();
        assert!(harness.engine.active_limbo_document_resolutions().is_empty());
        assert!(harness.engine.enqueued_limbo_document_resolutions().is_empty());
    }
}
