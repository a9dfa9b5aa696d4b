use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_lock::Mutex;

use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, unavailable, FirestoreError,
    FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::{LocalStore, TargetData, TargetId};
use crate::firestore::model::{DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, User};
use crate::firestore::remote::datastore::{
    Datastore, ListenRequest, WatchRequest, WatchStreamHandle, WriteRequest, WriteResponse,
    WriteStreamHandle,
};
use crate::firestore::remote::online_state::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::platform::runtime::{sleep, spawn_detached};
use crate::util::backoff::{BackoffSettings, ExponentialBackoff};

/// Batches sent to the backend but not yet acknowledged.
const MAX_PENDING_WRITES: usize = 10;

/// How long the first watch stream attempt may take before the client is
/// reported offline.
const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reasons why the remote store keeps its streams closed. The network is only
/// used while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    IsSecondary,
    CredentialChange,
    Shutdown,
}

struct WatchStreamState {
    handle: Option<WatchStreamHandle>,
    /// Identifies the current stream attempt. Callbacks of older attempts are
    /// dropped.
    generation: u64,
    started: bool,
    aggregator: Option<WatchChangeAggregator>,
    backoff: ExponentialBackoff,
}

struct WriteStreamState {
    handle: Option<WriteStreamHandle>,
    generation: u64,
    started: bool,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
    /// Batches sent (or to be sent after the handshake), oldest first.
    pipeline: VecDeque<MutationBatch>,
    backoff: ExponentialBackoff,
}

struct RemoteStoreState {
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch: WatchStreamState,
    write: WriteStreamState,
    offline_causes: BTreeSet<OfflineCause>,
    online_state: OnlineStateTracker,
}

impl RemoteStoreState {
    fn new(backoff: BackoffSettings) -> Self {
        Self {
            listen_targets: BTreeMap::new(),
            watch: WatchStreamState {
                handle: None,
                generation: 0,
                started: false,
                aggregator: None,
                backoff: ExponentialBackoff::new(backoff),
            },
            write: WriteStreamState {
                handle: None,
                generation: 0,
                started: false,
                handshake_complete: false,
                last_stream_token: Vec::new(),
                pipeline: VecDeque::new(),
                backoff: ExponentialBackoff::new(backoff),
            },
            // Network use starts once the client learns it is primary.
            offline_causes: BTreeSet::from([OfflineCause::IsSecondary]),
            online_state: OnlineStateTracker::new(),
        }
    }

    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch.started && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write.started && !self.write.pipeline.is_empty()
    }
}

struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: Option<&'a dyn RemoteSyncer>,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the watch and write streams of the primary client.
///
/// Targets registered with `listen` are kept across reconnects and re-sent with
/// their latest resume token. Pending batches flow from the local mutation
/// queue through a bounded pipeline to the write stream.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        database_id: DatabaseId,
        datastore: Arc<dyn Datastore>,
        local_store: Arc<LocalStore>,
        backoff: BackoffSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RemoteStoreInner {
                state: Mutex::new(RemoteStoreState::new(backoff)),
                database_id,
                datastore,
                local_store,
                syncer: StdMutex::new(None),
            }),
        }
    }

    /// Connects the store to the layer that consumes its events.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        *self
            .inner
            .syncer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(syncer);
    }

    /// Re-enables the network after `disable_network`.
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.enable_network().await
    }

    /// Closes both streams until `enable_network`. Queued writes stay in the
    /// mutation queue and are resent later.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.disable_network().await
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    /// Starts listening to `target_data`. Already listened targets are ignored.
    pub async fn listen(&self, target_data: TargetData) {
        self.inner.listen(target_data).await
    }

    pub async fn unlisten(&self, target_id: TargetId) {
        self.inner.unlisten(target_id).await
    }

    /// Moves pending batches from the mutation queue into the write pipeline.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams around the syncer's switch to `user`.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.handle_credential_change(user).await
    }

    /// Only the primary client talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        self.inner.apply_primary_state(is_primary).await
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.can_use_network()
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.state.lock().await.online_state.state()
    }

    pub async fn is_listening(&self, target_id: TargetId) -> bool {
        self.inner
            .state
            .lock()
            .await
            .listen_targets
            .contains_key(&target_id)
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    database_id: DatabaseId,
    datastore: Arc<dyn Datastore>,
    local_store: Arc<LocalStore>,
    syncer: StdMutex<Option<Weak<dyn RemoteSyncer>>>,
}

impl RemoteStoreInner {
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn notify_online_state(&self, changes: impl IntoIterator<Item = Option<OnlineState>>) {
        let changes: Vec<OnlineState> = changes.into_iter().flatten().collect();
        if changes.is_empty() {
            return;
        }
        if let Some(syncer) = self.syncer() {
            for state in changes {
                log::debug!("online state changed to {state}");
                syncer.apply_online_state_change(state);
            }
        }
    }

    async fn enable_network(self: &Arc<Self>) -> FirestoreResult<()> {
        let change = {
            let mut state = self.state.lock().await;
            state.offline_causes.remove(&OfflineCause::UserDisabled);
            self.enable_network_locked(&mut state)
        };
        self.notify_online_state([change]);
        self.fill_write_pipeline().await
    }

    async fn disable_network(self: &Arc<Self>) -> FirestoreResult<()> {
        let change = {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::UserDisabled);
            Self::disable_network_locked(&mut state);
            state.online_state.set(OnlineState::Offline)
        };
        self.notify_online_state([change]);
        Ok(())
    }

    async fn shutdown(self: &Arc<Self>) {
        log::debug!("remote store shutting down");
        let change = {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::Shutdown);
            Self::disable_network_locked(&mut state);
            state.online_state.set(OnlineState::Unknown)
        };
        self.notify_online_state([change]);
    }

    async fn handle_credential_change(self: &Arc<Self>, user: User) -> FirestoreResult<()> {
        let change = {
            let mut state = self.state.lock().await;
            let used_network = state.can_use_network();
            state.offline_causes.insert(OfflineCause::CredentialChange);
            Self::disable_network_locked(&mut state);
            if used_network {
                log::debug!("restarting streams for new credential");
                state.online_state.set(OnlineState::Unknown)
            } else {
                None
            }
        };
        self.notify_online_state([change]);

        let result = match self.syncer() {
            Some(syncer) => syncer.handle_credential_change(user).await,
            None => Ok(()),
        };

        let change = {
            let mut state = self.state.lock().await;
            state.offline_causes.remove(&OfflineCause::CredentialChange);
            self.enable_network_locked(&mut state)
        };
        self.notify_online_state([change]);
        result?;
        self.fill_write_pipeline().await
    }

    async fn apply_primary_state(self: &Arc<Self>, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            let change = {
                let mut state = self.state.lock().await;
                state.offline_causes.remove(&OfflineCause::IsSecondary);
                self.enable_network_locked(&mut state)
            };
            self.notify_online_state([change]);
            self.fill_write_pipeline().await
        } else {
            let change = {
                let mut state = self.state.lock().await;
                state.offline_causes.insert(OfflineCause::IsSecondary);
                Self::disable_network_locked(&mut state);
                state.online_state.set(OnlineState::Unknown)
            };
            self.notify_online_state([change]);
            Ok(())
        }
    }

    fn enable_network_locked(self: &Arc<Self>, state: &mut RemoteStoreState) -> Option<OnlineState> {
        if !state.can_use_network() {
            return None;
        }
        if state.should_start_watch_stream() {
            self.start_watch_stream_locked(state)
        } else {
            state.online_state.set(OnlineState::Unknown)
        }
    }

    fn disable_network_locked(state: &mut RemoteStoreState) {
        state.watch.generation += 1;
        state.watch.backoff.reset();
        Self::clean_up_watch_stream_locked(state);

        state.write.generation += 1;
        state.write.backoff.reset();
        Self::clean_up_write_stream_locked(state);
        if !state.write.pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                state.write.pipeline.len()
            );
            state.write.pipeline.clear();
        }
    }

    async fn listen(self: &Arc<Self>, target_data: TargetData) {
        let syncer = self.syncer();
        let change = {
            let mut state = self.state.lock().await;
            let target_id = target_data.target_id;
            if state.listen_targets.contains_key(&target_id) {
                return;
            }
            state.listen_targets.insert(target_id, target_data.clone());
            if state.should_start_watch_stream() {
                self.start_watch_stream_locked(&mut state)
            } else {
                if state.watch.handle.is_some() {
                    Self::send_watch_request_locked(&mut state, syncer.as_deref(), target_data);
                }
                None
            }
        };
        self.notify_online_state([change]);
    }

    async fn unlisten(self: &Arc<Self>, target_id: TargetId) {
        let change = {
            let mut state = self.state.lock().await;
            if state.listen_targets.remove(&target_id).is_none() {
                return;
            }
            if state.watch.handle.is_some() {
                Self::send_unwatch_request_locked(&mut state, target_id);
            }
            if state.listen_targets.is_empty()
                && state.watch.handle.is_none()
                && state.can_use_network()
            {
                state.online_state.set(OnlineState::Unknown)
            } else {
                None
            }
        };
        self.notify_online_state([change]);
    }

    // Watch stream

    fn start_watch_stream_locked(self: &Arc<Self>, state: &mut RemoteStoreState) -> Option<OnlineState> {
        state.watch.generation += 1;
        state.watch.started = true;
        state.watch.aggregator = Some(WatchChangeAggregator::new(self.database_id.clone()));
        let generation = state.watch.generation;
        let delay = state.watch.backoff.next_delay();

        let (change, timer) = state.online_state.handle_watch_stream_start();
        if let Some(timer) = timer {
            self.spawn_online_state_timeout(timer);
        }

        log::debug!("starting watch stream after {delay:?}");
        let weak = Arc::downgrade(self);
        let datastore = Arc::clone(&self.datastore);
        spawn_detached(async move {
            sleep(delay).await;
            if !Self::is_current_watch(&weak, generation).await {
                return;
            }
            let opened = datastore.open_watch_stream().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let handle = match opened {
                Ok(handle) => handle,
                Err(error) => {
                    inner.on_watch_stream_close(generation, Some(error)).await;
                    return;
                }
            };
            if !inner.on_watch_stream_open(generation, &handle).await {
                handle.close();
                return;
            }
            drop(inner);
            run_watch_stream(weak, generation, handle).await;
        });
        change
    }

    async fn is_current_watch(weak: &Weak<Self>, generation: u64) -> bool {
        match weak.upgrade() {
            Some(inner) => inner.state.lock().await.watch.generation == generation,
            None => false,
        }
    }

    fn spawn_online_state_timeout(self: &Arc<Self>, timer: u64) {
        let weak = Arc::downgrade(self);
        spawn_detached(async move {
            sleep(ONLINE_STATE_TIMEOUT).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let change = inner.state.lock().await.online_state.handle_connect_timeout(timer);
            inner.notify_online_state([change]);
        });
    }

    async fn on_watch_stream_open(&self, generation: u64, handle: &WatchStreamHandle) -> bool {
        let syncer = self.syncer();
        let mut state = self.state.lock().await;
        if state.watch.generation != generation || !state.can_use_network() {
            return false;
        }
        state.watch.handle = Some(handle.clone());
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        log::debug!("watch stream open, sending {} targets", targets.len());
        for target_data in targets {
            Self::send_watch_request_locked(&mut state, syncer.as_deref(), target_data);
        }
        true
    }

    fn send_watch_request_locked(
        state: &mut RemoteStoreState,
        syncer: Option<&dyn RemoteSyncer>,
        mut target_data: TargetData,
    ) {
        let Some(handle) = state.watch.handle.clone() else {
            return;
        };
        let target_id = target_data.target_id;
        if let Some(aggregator) = state.watch.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_none() {
            let expected = syncer
                .map(|syncer| syncer.get_remote_keys_for_target(target_id).len())
                .unwrap_or_default();
            target_data = target_data.with_expected_count(i32::try_from(expected).unwrap_or(i32::MAX));
        }
        if let Err(err) = handle.send(WatchRequest::Listen(ListenRequest::from_target_data(&target_data))) {
            log::debug!("failed to send listen for target {target_id}: {err}");
        }
    }

    fn send_unwatch_request_locked(state: &mut RemoteStoreState, target_id: TargetId) {
        let Some(handle) = state.watch.handle.clone() else {
            return;
        };
        if let Some(aggregator) = state.watch.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        if let Err(err) = handle.send(WatchRequest::Unlisten(target_id)) {
            log::debug!("failed to send unlisten for target {target_id}: {err}");
        }
    }

    async fn on_watch_change(&self, generation: u64, change: WatchChange) -> FirestoreResult<()> {
        let syncer = self.syncer();
        let mut rejected = Vec::new();
        let online_change;
        let event;
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.watch.generation != generation {
                return Ok(());
            }
            state.watch.backoff.reset();
            online_change = state.online_state.set(OnlineState::Online);

            if let WatchChange::Target(target_change) = &change {
                if let (TargetChangeState::Removed, Some(cause)) =
                    (target_change.state, &target_change.cause)
                {
                    for target_id in &target_change.target_ids {
                        if state.listen_targets.remove(target_id).is_some() {
                            if let Some(aggregator) = state.watch.aggregator.as_mut() {
                                aggregator.remove_target(*target_id);
                            }
                            rejected.push((*target_id, cause.clone()));
                        }
                    }
                }
            }

            if rejected.is_empty() {
                {
                    let RemoteStoreState {
                        listen_targets,
                        watch,
                        ..
                    } = &mut *state;
                    let Some(aggregator) = watch.aggregator.as_mut() else {
                        return Ok(());
                    };
                    let metadata = ListenMetadata {
                        listen_targets,
                        syncer: syncer.as_deref(),
                    };
                    match &change {
                        WatchChange::Document(document_change) => {
                            aggregator.handle_document_change(document_change, &metadata)
                        }
                        WatchChange::Target(target_change) => {
                            aggregator.handle_target_change(target_change, &metadata)
                        }
                        WatchChange::ExistenceFilter(filter) => {
                            aggregator.handle_existence_filter(filter, &metadata)
                        }
                    }
                }

                event = match &change {
                    WatchChange::Target(target_change)
                        if target_change.is_global_snapshot()
                            && !target_change.read_time.is_none() =>
                    {
                        let last_remote_version = self.local_store.get_last_remote_snapshot_version()?;
                        if target_change.read_time >= last_remote_version {
                            Self::raise_watch_snapshot_locked(
                                state,
                                syncer.as_deref(),
                                target_change.read_time,
                            )
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
            } else {
                event = None;
            }
        }

        self.notify_online_state([online_change]);
        let Some(syncer) = syncer else {
            return Ok(());
        };
        for (target_id, cause) in rejected {
            log::debug!("target {target_id} rejected by the backend: {cause}");
            syncer.reject_listen(target_id, cause).await?;
        }
        if let Some(event) = event {
            syncer.apply_remote_event(event).await?;
        }
        Ok(())
    }

    /// Builds the event for a consistent snapshot and restarts every target whose
    /// existence filter did not match.
    fn raise_watch_snapshot_locked(
        state: &mut RemoteStoreState,
        syncer: Option<&dyn RemoteSyncer>,
        snapshot_version: SnapshotVersion,
    ) -> Option<RemoteEvent> {
        let event = {
            let RemoteStoreState {
                listen_targets,
                watch,
                ..
            } = &mut *state;
            let aggregator = watch.aggregator.as_mut()?;
            let metadata = ListenMetadata {
                listen_targets,
                syncer,
            };
            aggregator.create_remote_event(snapshot_version, &metadata)
        };

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = state.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = state.listen_targets.get(target_id).cloned() else {
                continue;
            };
            log::debug!("existence filter mismatch for target {target_id}, re-listening");
            state.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Vec::new(), target_data.snapshot_version),
            );
            Self::send_unwatch_request_locked(state, *target_id);
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            Self::send_watch_request_locked(state, syncer, request);
        }

        Some(event)
    }

    async fn on_watch_stream_close(self: &Arc<Self>, generation: u64, error: Option<FirestoreError>) {
        let mut rejected = Vec::new();
        let changes = {
            let mut state = self.state.lock().await;
            if state.watch.generation != generation {
                return;
            }
            let error = error.unwrap_or_else(|| unavailable("watch stream closed by the backend"));
            log::debug!("watch stream closed: {error}");
            Self::clean_up_watch_stream_locked(&mut state);
            if error.code == FirestoreErrorCode::ResourceExhausted {
                state.watch.backoff.reset_to_max();
            }
            if is_permanent_error(error.code) {
                log::warn!("watch stream failed permanently: {error}");
                rejected = std::mem::take(&mut state.listen_targets)
                    .into_keys()
                    .map(|target_id| (target_id, error.clone()))
                    .collect();
            }

            if state.should_start_watch_stream() {
                let failure = state
                    .online_state
                    .handle_watch_stream_failure(&error.to_string());
                let restart = self.start_watch_stream_locked(&mut state);
                [failure, restart]
            } else {
                [state.online_state.set(OnlineState::Unknown), None]
            }
        };
        self.notify_online_state(changes);

        if rejected.is_empty() {
            return;
        }
        if let Some(syncer) = self.syncer() {
            for (target_id, error) in rejected {
                if let Err(err) = syncer.reject_listen(target_id, error).await {
                    log::warn!("failed to reject target {target_id}: {err}");
                }
            }
        }
    }

    fn clean_up_watch_stream_locked(state: &mut RemoteStoreState) {
        if let Some(handle) = state.watch.handle.take() {
            handle.close();
        }
        state.watch.started = false;
        state.watch.aggregator = None;
    }

    // Write stream

    async fn fill_write_pipeline(self: &Arc<Self>) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let mut last_batch_id = state.write.pipeline.back().map(|batch| batch.batch_id);
        while state.can_use_network() && state.write.pipeline.len() < MAX_PENDING_WRITES {
            let Some(batch) = self.local_store.next_mutation_batch(last_batch_id)? else {
                break;
            };
            last_batch_id = Some(batch.batch_id);
            if state.write.handshake_complete {
                Self::send_mutations_locked(&state, &batch);
            }
            state.write.pipeline.push_back(batch);
        }
        if state.should_start_write_stream() {
            self.start_write_stream_locked(&mut state);
        }
        Ok(())
    }

    fn send_mutations_locked(state: &RemoteStoreState, batch: &MutationBatch) {
        let Some(handle) = state.write.handle.as_ref() else {
            return;
        };
        let request = WriteRequest::Mutations {
            stream_token: state.write.last_stream_token.clone(),
            mutations: batch.mutations.clone(),
        };
        if let Err(err) = handle.send(request) {
            log::debug!("failed to send batch {}: {err}", batch.batch_id);
        }
    }

    fn start_write_stream_locked(self: &Arc<Self>, state: &mut RemoteStoreState) {
        state.write.generation += 1;
        state.write.started = true;
        state.write.handshake_complete = false;
        let generation = state.write.generation;
        let delay = state.write.backoff.next_delay();

        log::debug!("starting write stream after {delay:?}");
        let weak = Arc::downgrade(self);
        let datastore = Arc::clone(&self.datastore);
        spawn_detached(async move {
            sleep(delay).await;
            if !Self::is_current_write(&weak, generation).await {
                return;
            }
            let opened = datastore.open_write_stream().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let handle = match opened {
                Ok(handle) => handle,
                Err(error) => {
                    inner.on_write_stream_close(generation, Some(error)).await;
                    return;
                }
            };
            if !inner.on_write_stream_open(generation, &handle).await {
                handle.close();
                return;
            }
            drop(inner);
            run_write_stream(weak, generation, handle).await;
        });
    }

    async fn is_current_write(weak: &Weak<Self>, generation: u64) -> bool {
        match weak.upgrade() {
            Some(inner) => inner.state.lock().await.write.generation == generation,
            None => false,
        }
    }

    async fn on_write_stream_open(&self, generation: u64, handle: &WriteStreamHandle) -> bool {
        let mut state = self.state.lock().await;
        if state.write.generation != generation || !state.can_use_network() {
            return false;
        }
        state.write.handle = Some(handle.clone());
        if let Err(err) = handle.send(WriteRequest::Handshake) {
            log::debug!("failed to send write handshake: {err}");
        }
        true
    }

    async fn on_write_response(self: &Arc<Self>, generation: u64, response: WriteResponse) -> FirestoreResult<()> {
        match response {
            WriteResponse::Handshake { stream_token } => {
                let mut state = self.state.lock().await;
                if state.write.generation != generation {
                    return Ok(());
                }
                self.local_store.set_last_stream_token(stream_token.clone())?;
                state.write.backoff.reset();
                state.write.handshake_complete = true;
                state.write.last_stream_token = stream_token;
                log::debug!(
                    "write stream handshake complete, sending {} batches",
                    state.write.pipeline.len()
                );
                for batch in &state.write.pipeline {
                    Self::send_mutations_locked(&state, batch);
                }
                Ok(())
            }
            WriteResponse::Mutations {
                stream_token,
                commit_version,
                mutation_results,
            } => {
                let batch = {
                    let mut state = self.state.lock().await;
                    if state.write.generation != generation {
                        return Ok(());
                    }
                    state.write.backoff.reset();
                    state.write.last_stream_token = stream_token.clone();
                    state
                        .write
                        .pipeline
                        .pop_front()
                        .ok_or_else(|| internal_error("write response without a pending batch"))?
                };
                let result =
                    MutationBatchResult::from(batch, commit_version, mutation_results, stream_token)?;
                if let Some(syncer) = self.syncer() {
                    syncer.apply_successful_write(result).await?;
                }
                self.fill_write_pipeline().await
            }
        }
    }

    async fn on_write_stream_close(self: &Arc<Self>, generation: u64, error: Option<FirestoreError>) {
        let rejected = {
            let mut state = self.state.lock().await;
            if state.write.generation != generation {
                return;
            }
            let handshake_complete = state.write.handshake_complete;
            Self::clean_up_write_stream_locked(&mut state);
            let error = error.unwrap_or_else(|| unavailable("write stream closed by the backend"));
            log::debug!("write stream closed: {error}");
            if error.code == FirestoreErrorCode::ResourceExhausted {
                state.write.backoff.reset_to_max();
            }

            let mut rejected = None;
            if is_permanent_write_error(error.code) {
                if handshake_complete {
                    if let Some(batch) = state.write.pipeline.pop_front() {
                        state.write.backoff.reset();
                        rejected = Some((batch.batch_id, error));
                    }
                } else {
                    log::debug!("write handshake failed permanently, resetting stream token: {error}");
                    state.write.last_stream_token.clear();
                    if let Err(err) = self.local_store.set_last_stream_token(Vec::new()) {
                        log::warn!("failed to reset stream token: {err}");
                    }
                }
            }

            if rejected.is_none() && state.should_start_write_stream() {
                self.start_write_stream_locked(&mut state);
            }
            rejected
        };

        let Some((batch_id, error)) = rejected else {
            return;
        };
        log::warn!("write batch {batch_id} rejected: {error}");
        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.reject_failed_write(batch_id, error).await {
                log::warn!("failed to reject batch {batch_id}: {err}");
            }
        }
        if let Err(err) = self.fill_write_pipeline().await {
            log::warn!("failed to refill write pipeline: {err}");
        }
    }

    fn clean_up_write_stream_locked(state: &mut RemoteStoreState) {
        if let Some(handle) = state.write.handle.take() {
            handle.close();
        }
        state.write.started = false;
        state.write.handshake_complete = false;
    }
}

async fn run_watch_stream(weak: Weak<RemoteStoreInner>, generation: u64, handle: WatchStreamHandle) {
    loop {
        let next = handle.next().await;
        let Some(inner) = weak.upgrade() else {
            handle.close();
            return;
        };
        match next {
            Some(Ok(change)) => {
                if let Err(error) = inner.on_watch_change(generation, change).await {
                    log::warn!("failed to apply watch change: {error}");
                    handle.close();
                    inner.on_watch_stream_close(generation, Some(error)).await;
                    return;
                }
            }
            Some(Err(error)) => {
                inner.on_watch_stream_close(generation, Some(error)).await;
                return;
            }
            None => {
                inner.on_watch_stream_close(generation, None).await;
                return;
            }
        }
    }
}

async fn run_write_stream(weak: Weak<RemoteStoreInner>, generation: u64, handle: WriteStreamHandle) {
    loop {
        let next = handle.next().await;
        let Some(inner) = weak.upgrade() else {
            handle.close();
            return;
        };
        match next {
            Some(Ok(response)) => {
                if let Err(error) = inner.on_write_response(generation, response).await {
                    log::warn!("failed to apply write response: {error}");
                    handle.close();
                    inner.on_write_stream_close(generation, Some(error)).await;
                    return;
                }
            }
            Some(Err(error)) => {
                inner.on_write_stream_close(generation, Some(error)).await;
                return;
            }
            None => {
                inner.on_write_stream_close(generation, None).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::Persistence;
    use crate::firestore::model::{
        BatchId, FieldPath, MutableDocument, Mutation, MutationResult, ResourcePath,
    };
    use crate::firestore::remote::datastore::InMemoryDatastore;
    use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::remote::watch_change::{DocumentChange, ExistenceFilter, WatchTargetChange};
    use crate::firestore::value::{FirestoreValue, MapValue};

    #[derive(Debug)]
    enum SyncerCall {
        RemoteEvent(RemoteEvent),
        RejectListen(TargetId, FirestoreError),
        Write(MutationBatchResult),
        RejectWrite(BatchId, FirestoreError),
        Online(OnlineState),
    }

    struct RecordingSyncer {
        local_store: Arc<LocalStore>,
        calls: async_channel::Sender<SyncerCall>,
    }

    impl RemoteSyncer for RecordingSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.local_store.apply_remote_event(&event)?;
                let _ = self.calls.try_send(SyncerCall::RemoteEvent(event));
                Ok(())
            })
        }

        fn reject_listen(
            &self,
            target_id: TargetId,
            error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self.calls.try_send(SyncerCall::RejectListen(target_id, error));
                Ok(())
            })
        }

        fn apply_successful_write(
            &self,
            result: MutationBatchResult,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.local_store.acknowledge_batch(&result)?;
                let _ = self.calls.try_send(SyncerCall::Write(result));
                Ok(())
            })
        }

        fn reject_failed_write(
            &self,
            batch_id: BatchId,
            error: FirestoreError,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.local_store.reject_batch(batch_id)?;
                let _ = self.calls.try_send(SyncerCall::RejectWrite(batch_id, error));
                Ok(())
            })
        }

        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.local_store
                .remote_document_keys(target_id)
                .unwrap_or_default()
        }

        fn apply_online_state_change(&self, online_state: OnlineState) {
            let _ = self.calls.try_send(SyncerCall::Online(online_state));
        }

        fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.local_store.handle_user_change(user)?;
                Ok(())
            })
        }
    }

    struct Harness {
        store: RemoteStore,
        datastore: InMemoryDatastore,
        local_store: Arc<LocalStore>,
        calls: async_channel::Receiver<SyncerCall>,
        _syncer: Arc<RecordingSyncer>,
    }

    fn harness() -> Harness {
        let local_store = Arc::new(LocalStore::new(
            Persistence::memory(),
            User::unauthenticated(),
            None,
        ));
        let datastore = InMemoryDatastore::new();
        let store = RemoteStore::new(
            DatabaseId::default_database("test"),
            Arc::new(datastore.clone()),
            Arc::clone(&local_store),
            BackoffSettings {
                initial_delay_millis: 5,
                max_delay_millis: 20,
                ..BackoffSettings::default()
            },
        );
        let (sender, calls) = async_channel::unbounded();
        let syncer = Arc::new(RecordingSyncer {
            local_store: Arc::clone(&local_store),
            calls: sender,
        });
        let dyn_syncer: Arc<dyn RemoteSyncer> = syncer.clone();
        store.set_syncer(Arc::downgrade(&dyn_syncer));
        Harness {
            store,
            datastore,
            local_store,
            calls,
            _syncer: syncer,
        }
    }

    async fn next_call(calls: &async_channel::Receiver<SyncerCall>) -> SyncerCall {
        tokio::time::timeout(Duration::from_secs(5), calls.recv())
            .await
            .expect("timed out waiting for syncer call")
            .expect("syncer channel closed")
    }

    /// Skips online state notifications.
    async fn next_event(calls: &async_channel::Receiver<SyncerCall>) -> SyncerCall {
        loop {
            match next_call(calls).await {
                SyncerCall::Online(_) => continue,
                call => return call,
            }
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(
            &FieldPath::from_dot_separated("n").unwrap(),
            FirestoreValue::from_integer(value),
        );
        map
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    fn rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap())
    }

    fn send_snapshot(
        server: &crate::firestore::remote::datastore::WatchServerStream,
        target_id: TargetId,
        doc: &str,
        at: i64,
        token: &[u8],
    ) {
        server
            .send(WatchChange::Target(WatchTargetChange::new(
                TargetChangeState::Added,
                vec![target_id],
            )))
            .unwrap();
        server
            .send(WatchChange::Document(DocumentChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: vec![],
                key: key(doc),
                document: Some(MutableDocument::new_found(key(doc), version(at), data(1))),
            }))
            .unwrap();
        server
            .send(WatchChange::Target(
                WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
                    .with_resume_token(token.to_vec()),
            ))
            .unwrap();
        server
            .send(WatchChange::Target(WatchTargetChange::global_snapshot(
                version(at),
                token.to_vec(),
            )))
            .unwrap();
    }

    #[tokio::test]
    async fn streams_stay_closed_until_primary() {
        let harness = harness();
        assert!(!harness.store.can_use_network().await);
        harness.store.apply_primary_state(true).await.unwrap();
        assert!(harness.store.can_use_network().await);
        harness.store.disable_network().await.unwrap();
        assert!(!harness.store.can_use_network().await);
        assert_eq!(harness.store.online_state().await, OnlineState::Offline);
    }

    #[tokio::test]
    async fn listen_raises_remote_events_on_global_snapshots() {
        let harness = harness();
        harness.store.apply_primary_state(true).await.unwrap();
        let target_data = harness.local_store.allocate_target(rooms().to_target()).unwrap();
        let target_id = target_data.target_id;
        harness.store.listen(target_data).await;

        let server = harness.datastore.accept_watch().await.unwrap();
        match server.next_request().await.unwrap() {
            WatchRequest::Listen(listen) => {
                assert_eq!(listen.target_id, target_id);
                assert!(listen.resume_token.is_empty());
                assert_eq!(listen.expected_count, None);
            }
            other => panic!("unexpected request {other:?}"),
        }

        send_snapshot(&server, target_id, "rooms/a", 10, b"t1");
        assert!(matches!(
            next_call(&harness.calls).await,
            SyncerCall::Online(OnlineState::Online)
        ));
        match next_event(&harness.calls).await {
            SyncerCall::RemoteEvent(event) => {
                assert_eq!(event.snapshot_version, version(10));
                assert!(event.document_updates.contains_key(&key("rooms/a")));
                assert!(event.target_changes[&target_id].current);
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(
            harness.local_store.remote_document_keys(target_id).unwrap(),
            BTreeSet::from([key("rooms/a")])
        );
    }

    #[tokio::test]
    async fn reconnect_resumes_targets_with_their_token() {
        let harness = harness();
        harness.store.apply_primary_state(true).await.unwrap();
        let target_data = harness.local_store.allocate_target(rooms().to_target()).unwrap();
        let target_id = target_data.target_id;
        harness.store.listen(target_data).await;

        let server = harness.datastore.accept_watch().await.unwrap();
        server.next_request().await.unwrap();
        send_snapshot(&server, target_id, "rooms/a", 10, b"t1");
        assert!(matches!(next_event(&harness.calls).await, SyncerCall::RemoteEvent(_)));

        server.fail(unavailable("connection reset"));
        let server = harness.datastore.accept_watch().await.unwrap();
        match server.next_request().await.unwrap() {
            WatchRequest::Listen(listen) => {
                assert_eq!(listen.target_id, target_id);
                assert_eq!(listen.resume_token, b"t1".to_vec());
                assert_eq!(listen.expected_count, Some(1));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn existence_filter_mismatch_relistens_from_scratch() {
        let harness = harness();
        harness.store.apply_primary_state(true).await.unwrap();
        let target_data = harness.local_store.allocate_target(rooms().to_target()).unwrap();
        let target_id = target_data.target_id;
        harness.store.listen(target_data).await;

        let server = harness.datastore.accept_watch().await.unwrap();
        server.next_request().await.unwrap();
        send_snapshot(&server, target_id, "rooms/a", 10, b"t1");
        assert!(matches!(next_event(&harness.calls).await, SyncerCall::RemoteEvent(_)));

        // The backend counts two documents, the client only knows one.
        server
            .send(WatchChange::ExistenceFilter(ExistenceFilter::new(target_id, 2)))
            .unwrap();
        server
            .send(WatchChange::Target(WatchTargetChange::global_snapshot(
                version(20),
                b"t2".to_vec(),
            )))
            .unwrap();

        assert_eq!(
            server.next_request().await.unwrap(),
            WatchRequest::Unlisten(target_id)
        );
        match server.next_request().await.unwrap() {
            WatchRequest::Listen(listen) => {
                assert_eq!(listen.target_id, target_id);
                assert_eq!(listen.purpose, TargetPurpose::ExistenceFilterMismatch);
                assert!(listen.resume_token.is_empty());
                assert_eq!(listen.expected_count, None);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn removed_target_with_cause_is_rejected() {
        let harness = harness();
        harness.store.apply_primary_state(true).await.unwrap();
        let target_data = harness.local_store.allocate_target(rooms().to_target()).unwrap();
        let target_id = target_data.target_id;
        harness.store.listen(target_data).await;

        let server = harness.datastore.accept_watch().await.unwrap();
        server.next_request().await.unwrap();
        server
            .send(WatchChange::Target(
                WatchTargetChange::new(TargetChangeState::Removed, vec![target_id]).with_cause(
                    FirestoreError::new(FirestoreErrorCode::PermissionDenied, "denied"),
                ),
            ))
            .unwrap();

        match next_event(&harness.calls).await {
            SyncerCall::RejectListen(id, error) => {
                assert_eq!(id, target_id);
                assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
            }
            other => panic!("unexpected call {other:?}"),
        }
        assert!(!harness.store.is_listening(target_id).await);
    }

    #[tokio::test]
    async fn writes_are_sent_after_the_handshake_and_acknowledged() {
        let harness = harness();
        let write = harness
            .local_store
            .write_locally(vec![Mutation::set(key("rooms/a"), data(1))])
            .unwrap();
        harness.store.apply_primary_state(true).await.unwrap();

        let server = harness.datastore.accept_write().await.unwrap();
        assert_eq!(server.next_request().await, Some(WriteRequest::Handshake));
        server
            .send(WriteResponse::Handshake {
                stream_token: b"s1".to_vec(),
            })
            .unwrap();
        match server.next_request().await.unwrap() {
            WriteRequest::Mutations {
                stream_token,
                mutations,
            } => {
                assert_eq!(stream_token, b"s1".to_vec());
                assert_eq!(mutations.len(), 1);
            }
            other => panic!("unexpected request {other:?}"),
        }

        server
            .send(WriteResponse::Mutations {
                stream_token: b"s2".to_vec(),
                commit_version: version(5),
                mutation_results: vec![MutationResult::new(version(5))],
            })
            .unwrap();
        match next_event(&harness.calls).await {
            SyncerCall::Write(result) => assert_eq!(result.batch.batch_id, write.batch_id),
            other => panic!("unexpected call {other:?}"),
        }
        assert_eq!(harness.local_store.get_last_stream_token().unwrap(), b"s2".to_vec());
        assert!(harness.local_store.next_mutation_batch(None).unwrap().is_none());
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_only_the_head_batch() {
        let harness = harness();
        let first = harness
            .local_store
            .write_locally(vec![Mutation::set(key("rooms/a"), data(1))])
            .unwrap();
        harness
            .local_store
            .write_locally(vec![Mutation::set(key("rooms/b"), data(2))])
            .unwrap();
        harness.store.apply_primary_state(true).await.unwrap();

        let server = harness.datastore.accept_write().await.unwrap();
        server.next_request().await.unwrap();
        server
            .send(WriteResponse::Handshake {
                stream_token: b"s1".to_vec(),
            })
            .unwrap();
        server.next_request().await.unwrap();
        server.next_request().await.unwrap();
        server.fail(FirestoreError::new(
            FirestoreErrorCode::InvalidArgument,
            "bad write",
        ));

        match next_event(&harness.calls).await {
            SyncerCall::RejectWrite(batch_id, error) => {
                assert_eq!(batch_id, first.batch_id);
                assert_eq!(error.code, FirestoreErrorCode::InvalidArgument);
            }
            other => panic!("unexpected call {other:?}"),
        }

        let server = harness.datastore.accept_write().await.unwrap();
        assert_eq!(server.next_request().await, Some(WriteRequest::Handshake));
        server
            .send(WriteResponse::Handshake {
                stream_token: b"s2".to_vec(),
            })
            .unwrap();
        match server.next_request().await.unwrap() {
            WriteRequest::Mutations { mutations, .. } => {
                assert_eq!(mutations[0].key(), &key("rooms/b"));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabling_the_network_keeps_queued_writes() {
        let harness = harness();
        harness
            .local_store
            .write_locally(vec![Mutation::set(key("rooms/a"), data(1))])
            .unwrap();
        harness.store.apply_primary_state(true).await.unwrap();
        let server = harness.datastore.accept_write().await.unwrap();
        server.next_request().await.unwrap();

        harness.store.disable_network().await.unwrap();
        assert!(matches!(
            next_call(&harness.calls).await,
            SyncerCall::Online(OnlineState::Offline)
        ));
        assert!(server.next_request().await.is_none());

        harness.store.enable_network().await.unwrap();
        let server = harness.datastore.accept_write().await.unwrap();
        assert_eq!(server.next_request().await, Some(WriteRequest::Handshake));
        server
            .send(WriteResponse::Handshake {
                stream_token: b"s1".to_vec(),
            })
            .unwrap();
        assert!(matches!(
            server.next_request().await,
            Some(WriteRequest::Mutations { .. })
        ));
    }
}
