use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_lock::Mutex as AsyncMutex;

use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::OnlineState;

pub type ListenerCallback = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots when only pending-write or from-cache metadata changed.
    pub include_metadata_changes: bool,
    /// Hold back from-cache results while the client may still be online.
    pub wait_for_sync_when_online: bool,
}

#[derive(Default)]
struct QueryListenerState {
    raised_initial_event: bool,
    snap: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// Decides which view snapshots a single listener gets to see.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    callback: ListenerCallback,
    state: Mutex<QueryListenerState>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, callback: ListenerCallback) -> Arc<Self> {
        Arc::new(Self {
            query,
            options,
            callback,
            state: Mutex::new(QueryListenerState::default()),
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns the snapshot to raise, if any.
    pub fn on_view_snapshot(&self, snap: ViewSnapshot) -> Option<ViewSnapshot> {
        let snap = if self.options.include_metadata_changes {
            snap
        } else {
            ViewSnapshot {
                doc_changes: snap
                    .doc_changes
                    .into_iter()
                    .filter(|change| change.change_type != ChangeType::Metadata)
                    .collect(),
                excludes_metadata_changes: true,
                ..snap
            }
        };

        let mut state = self.lock();
        let raised = if !state.raised_initial_event {
            if self.should_raise_initial_event(&snap, state.online_state) {
                state.raised_initial_event = true;
                Some(initial_event(&snap))
            } else {
                None
            }
        } else if self.should_raise_event(&snap, state.snap.as_ref()) {
            Some(snap.clone())
        } else {
            None
        };
        state.snap = Some(snap);
        raised
    }

    /// A snapshot held back while the online state was unknown may become
    /// raisable once the client knows it is offline.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> Option<ViewSnapshot> {
        let mut state = self.lock();
        state.online_state = online_state;
        let snap = state.snap.as_ref()?;
        if state.raised_initial_event || !self.should_raise_initial_event(snap, online_state) {
            return None;
        }
        let initial = initial_event(snap);
        state.raised_initial_event = true;
        Some(initial)
    }

    fn raise(&self, result: FirestoreResult<ViewSnapshot>) {
        (self.callback)(result);
    }

    fn should_raise_initial_event(&self, snap: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snap.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty from-cache result is only final once the client is known to
        // be offline.
        !snap.docs.is_empty() || snap.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snap: &ViewSnapshot, previous: Option<&ViewSnapshot>) -> bool {
        if !snap.doc_changes.is_empty() {
            return true;
        }
        let has_pending_writes_changed =
            previous.is_some_and(|previous| previous.has_pending_writes() != snap.has_pending_writes());
        if snap.sync_state_changed || has_pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn lock(&self) -> MutexGuard<'_, QueryListenerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn initial_event(snap: &ViewSnapshot) -> ViewSnapshot {
    ViewSnapshot::from_initial_documents(
        snap.query.clone(),
        snap.docs.clone(),
        snap.mutated_keys.clone(),
        snap.from_cache,
        snap.has_cached_results,
    )
}

struct QueryListenersInfo {
    view_snap: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

#[derive(Default)]
struct EventManagerState {
    /// Keyed by the query's canonical id so equal queries share one target.
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

type Delivery = (Arc<QueryListener>, FirestoreResult<ViewSnapshot>);

/// Fans view snapshots out to query listeners and keeps one sync engine
/// listen per distinct query.
pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    ops: AsyncMutex<()>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine: sync_engine.clone(),
            ops: AsyncMutex::new(()),
            state: Mutex::new(EventManagerState::default()),
        });
        let listener: Arc<dyn SyncEngineListener> = manager.clone();
        sync_engine.set_listener(Arc::downgrade(&listener));
        manager
    }

    pub async fn listen(&self, listener: Arc<QueryListener>) {
        let _guard = self.ops.lock().await;
        let canonical_id = listener.query().canonical_id();

        let first_listen = {
            let mut state = self.lock();
            let online_state = state.online_state;
            let info = state
                .queries
                .entry(canonical_id.clone())
                .or_insert_with(|| QueryListenersInfo {
                    view_snap: None,
                    listeners: Vec::new(),
                });
            let first_listen = info.listeners.is_empty();
            info.listeners.push(listener.clone());
            // Registered before the sync engine listen so that snapshots raised
            // while it runs already reach this listener.
            let mut deliveries = Vec::new();
            if let Some(raised) = listener.apply_online_state_change(online_state) {
                deliveries.push((listener.clone(), Ok(raised)));
            }
            if !first_listen {
                if let Some(view_snap) = info.view_snap.clone() {
                    if let Some(raised) = listener.on_view_snapshot(view_snap) {
                        deliveries.push((listener.clone(), Ok(raised)));
                    }
                }
            }
            drop(state);
            deliver(deliveries);
            first_listen
        };

        if !first_listen {
            return;
        }

        match self.sync_engine.listen(listener.query().clone()).await {
            Ok(view_snap) => {
                let mut deliveries = Vec::new();
                {
                    let mut state = self.lock();
                    if let Some(info) = state.queries.get_mut(&canonical_id) {
                        if info.view_snap.is_none() {
                            info.view_snap = Some(view_snap.clone());
                            for listener in &info.listeners {
                                if let Some(raised) = listener.on_view_snapshot(view_snap.clone()) {
                                    deliveries.push((listener.clone(), Ok(raised)));
                                }
                            }
                        }
                    }
                }
                deliver(deliveries);
            }
            Err(err) => {
                log::warn!("initialization of query {canonical_id} failed: {err}");
                let listeners = self
                    .lock()
                    .queries
                    .remove(&canonical_id)
                    .map(|info| info.listeners)
                    .unwrap_or_default();
                deliver(
                    listeners
                        .into_iter()
                        .map(|listener| (listener, Err(err.clone())))
                        .collect(),
                );
            }
        }
    }

    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let _guard = self.ops.lock().await;
        let canonical_id = listener.query().canonical_id();
        let last_listen = {
            let mut state = self.lock();
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let before = info.listeners.len();
            info.listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
            let removed = info.listeners.len() != before;
            let last_listen = removed && info.listeners.is_empty();
            if last_listen {
                state.queries.remove(&canonical_id);
            }
            last_listen
        };
        if last_listen {
            self.sync_engine.unlisten(listener.query()).await?;
        }
        Ok(())
    }

    pub fn online_state(&self) -> OnlineState {
        self.lock().online_state
    }

    fn lock(&self) -> MutexGuard<'_, EventManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.lock();
            for snapshot in snapshots {
                let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                for listener in &info.listeners {
                    if let Some(raised) = listener.on_view_snapshot(snapshot.clone()) {
                        deliveries.push((listener.clone(), Ok(raised)));
                    }
                }
                info.view_snap = Some(snapshot);
            }
        }
        deliver(deliveries);
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let listeners = self
            .lock()
            .queries
            .remove(&query.canonical_id())
            .map(|info| info.listeners)
            .unwrap_or_default();
        deliver(
            listeners
                .into_iter()
                .map(|listener| (listener, Err(error.clone())))
                .collect(),
        );
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.lock();
            state.online_state = online_state;
            for info in state.queries.values() {
                for listener in &info.listeners {
                    if let Some(raised) = listener.apply_online_state_change(online_state) {
                        deliveries.push((listener.clone(), Ok(raised)));
                    }
                }
            }
        }
        deliver(deliveries);
    }
}

/// Invokes callbacks outside of every lock so they may call back into the client.
fn deliver(deliveries: Vec<Delivery>) {
    for (listener, result) in deliveries {
        listener.raise(result);
    }
}
