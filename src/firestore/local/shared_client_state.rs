use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::firestore::error::FirestoreError;
use crate::firestore::local::shared_store::{SharedStore, SharedStoreEvent, SharedStoreSubscription};
use crate::firestore::local::target_data::TargetId;
use crate::firestore::model::{BatchId, User};
use crate::firestore::remote::OnlineState;
use crate::util::clock::Clock;

const CLIENT_STATE_PREFIX: &str = "firestore_clients";
const MUTATION_BATCH_PREFIX: &str = "firestore_mutations";
const QUERY_TARGET_PREFIX: &str = "firestore_targets";
const ONLINE_STATE_PREFIX: &str = "firestore_online_state";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchState {
    Pending,
    Acknowledged,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

/// Something another client did that this client has to react to.
#[derive(Clone, Debug, PartialEq)]
pub enum SharedClientEvent {
    BatchState {
        batch_id: BatchId,
        state: BatchState,
        error: Option<FirestoreError>,
    },
    TargetState {
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    },
    /// Targets that started or stopped being listened to by any client.
    ActiveTargetsChange {
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    },
    OnlineState(OnlineState),
}

/// Coordination state shared between the clients of one database: their
/// active targets, the outcome of their writes, the query states the primary
/// observes and the primary's online state.
pub trait SharedClientState: Send + Sync {
    /// Registers this client. `active_clients` are the ids persistence still
    /// considers alive; entries of other clients are ignored.
    fn start(&self, active_clients: &[String]);

    fn shutdown(&self);

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);

    fn add_pending_mutation(&self, batch_id: BatchId);

    fn update_mutation_state(&self, batch_id: BatchId, state: BatchState, error: Option<&FirestoreError>);

    /// Returns the state the primary last reported for the target, provided
    /// some client already listens to it.
    fn add_local_query_target(&self, target_id: TargetId, add_to_active_targets: bool) -> QueryTargetState;

    fn remove_local_query_target(&self, target_id: TargetId);

    fn is_local_query_target(&self, target_id: TargetId) -> bool;

    /// Whether any client, this one included, listens to the target.
    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId>;

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, error: Option<&FirestoreError>);

    fn clear_query_state(&self, target_id: TargetId);

    fn set_online_state(&self, online_state: OnlineState);

    /// Change feed of the underlying store, if other clients can exist.
    fn subscription(&self) -> Option<SharedStoreSubscription>;

    /// Translates one store change into the events this client must apply.
    fn handle_store_event(&self, event: SharedStoreEvent) -> Vec<SharedClientEvent>;

    /// Applies every change received so far.
    fn poll_events(&self) -> Vec<SharedClientEvent>;
}

/// Single client variant: nothing is shared, only local bookkeeping remains.
#[derive(Default)]
pub struct MemorySharedClientState {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    active_targets: BTreeSet<TargetId>,
    query_state: BTreeMap<TargetId, QueryTargetState>,
}

impl MemorySharedClientState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SharedClientState for MemorySharedClientState {
    fn start(&self, _active_clients: &[String]) {
        self.lock().active_targets.clear();
    }

    fn shutdown(&self) {}

    fn handle_user_change(&self, _user: &User, _removed: &[BatchId], _added: &[BatchId]) {}

    fn add_pending_mutation(&self, _batch_id: BatchId) {}

    fn update_mutation_state(&self, _batch_id: BatchId, _state: BatchState, _error: Option<&FirestoreError>) {}

    fn add_local_query_target(&self, target_id: TargetId, add_to_active_targets: bool) -> QueryTargetState {
        let mut state = self.lock();
        if add_to_active_targets {
            state.active_targets.insert(target_id);
        }
        state
            .query_state
            .get(&target_id)
            .copied()
            .unwrap_or(QueryTargetState::NotCurrent)
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        self.lock().active_targets.remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.lock().active_targets.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.is_local_query_target(target_id)
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        self.lock().active_targets.clone()
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, _error: Option<&FirestoreError>) {
        self.lock().query_state.insert(target_id, state);
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.lock().query_state.remove(&target_id);
    }

    fn set_online_state(&self, _online_state: OnlineState) {}

    fn subscription(&self) -> Option<SharedStoreSubscription> {
        None
    }

    fn handle_store_event(&self, _event: SharedStoreEvent) -> Vec<SharedClientEvent> {
        Vec::new()
    }

    fn poll_events(&self) -> Vec<SharedClientEvent> {
        Vec::new()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientStateEntry {
    active_target_ids: Vec<TargetId>,
    update_time_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationEntry {
    state: BatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<FirestoreError>,
    update_time_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryTargetEntry {
    state: QueryTargetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<FirestoreError>,
    update_time_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineStateEntry {
    client_id: String,
    online_state: String,
}

struct StoreState {
    started: bool,
    current_user: User,
    /// Active targets per client, this client included.
    active_clients: BTreeMap<String, BTreeSet<TargetId>>,
}

/// Multi-client variant over a `SharedStore`, keyed by the database's
/// persistence key so that clients of different databases never interact.
pub struct StoreSharedClientState {
    store: Arc<dyn SharedStore>,
    persistence_key: String,
    client_id: String,
    clock: Arc<dyn Clock>,
    subscription: SharedStoreSubscription,
    state: Mutex<StoreState>,
}

impl StoreSharedClientState {
    pub fn new(
        store: Arc<dyn SharedStore>,
        persistence_key: impl Into<String>,
        client_id: impl Into<String>,
        user: User,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let client_id = client_id.into();
        let subscription = store.subscribe();
        let mut active_clients = BTreeMap::new();
        active_clients.insert(client_id.clone(), BTreeSet::new());
        Self {
            store,
            persistence_key: persistence_key.into(),
            client_id,
            clock,
            subscription,
            state: Mutex::new(StoreState {
                started: false,
                current_user: user,
                active_clients,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn client_key(&self, client_id: &str) -> String {
        format!("{CLIENT_STATE_PREFIX}_{}_{client_id}", self.persistence_key)
    }

    fn mutation_key(&self, user: &User, batch_id: BatchId) -> String {
        let mut key = format!("{MUTATION_BATCH_PREFIX}_{}_{batch_id}", self.persistence_key);
        if let Some(uid) = user.uid() {
            key.push('_');
            key.push_str(uid);
        }
        key
    }

    fn target_key(&self, target_id: TargetId) -> String {
        format!("{QUERY_TARGET_PREFIX}_{}_{target_id}", self.persistence_key)
    }

    fn online_state_key(&self) -> String {
        format!("{ONLINE_STATE_PREFIX}_{}", self.persistence_key)
    }

    fn persist_client_state(&self, state: &StoreState) {
        let active_target_ids = state
            .active_clients
            .get(&self.client_id)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default();
        self.write_entry(
            &self.client_key(&self.client_id),
            &ClientStateEntry {
                active_target_ids,
                update_time_ms: self.clock.now_millis(),
            },
        );
    }

    fn persist_mutation_state(&self, user: &User, batch_id: BatchId, state: BatchState, error: Option<&FirestoreError>) {
        self.write_entry(
            &self.mutation_key(user, batch_id),
            &MutationEntry {
                state,
                error: error.cloned(),
                update_time_ms: self.clock.now_millis(),
            },
        );
    }

    fn write_entry<T: Serialize>(&self, key: &str, entry: &T) {
        match serde_json::to_string(entry) {
            Ok(value) => self.store.set(key, value),
            Err(err) => log::warn!("failed to encode shared client state entry {key}: {err}"),
        }
    }

    fn local_targets<'a>(state: &'a mut StoreState, client_id: &str) -> &'a mut BTreeSet<TargetId> {
        state.active_clients.entry(client_id.to_string()).or_default()
    }

    fn all_active_targets(active_clients: &BTreeMap<String, BTreeSet<TargetId>>) -> BTreeSet<TargetId> {
        active_clients.values().flatten().copied().collect()
    }

    fn handle_client_state_event(
        &self,
        state: &mut StoreState,
        client_id: &str,
        targets: Option<BTreeSet<TargetId>>,
    ) -> Option<SharedClientEvent> {
        let existing = Self::all_active_targets(&state.active_clients);
        match targets {
            Some(targets) => {
                state.active_clients.insert(client_id.to_string(), targets);
            }
            None => {
                state.active_clients.remove(client_id);
            }
        }
        let updated = Self::all_active_targets(&state.active_clients);
        let added: Vec<TargetId> = updated.difference(&existing).copied().collect();
        let removed: Vec<TargetId> = existing.difference(&updated).copied().collect();
        if added.is_empty() && removed.is_empty() {
            return None;
        }
        Some(SharedClientEvent::ActiveTargetsChange { added, removed })
    }

    fn handle_online_state_value(&self, state: &StoreState, value: &str) -> Option<SharedClientEvent> {
        let entry: OnlineStateEntry = match serde_json::from_str(value) {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("failed to parse online state: {err}");
                return None;
            }
        };
        // Only a live client's report counts.
        if !state.active_clients.contains_key(&entry.client_id) {
            return None;
        }
        OnlineState::parse(&entry.online_state).map(SharedClientEvent::OnlineState)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SharedClientState for StoreSharedClientState {
    fn start(&self, active_clients: &[String]) {
        let mut state = self.lock();
        for client_id in active_clients {
            if client_id == &self.client_id {
                continue;
            }
            let Some(value) = self.store.get(&self.client_key(client_id)) else {
                continue;
            };
            match serde_json::from_str::<ClientStateEntry>(&value) {
                Ok(entry) => {
                    state
                        .active_clients
                        .insert(client_id.clone(), entry.active_target_ids.into_iter().collect());
                }
                Err(err) => log::warn!("failed to parse client state of {client_id}: {err}"),
            }
        }
        self.persist_client_state(&state);
        state.started = true;
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        if state.started {
            self.store.remove(&self.client_key(&self.client_id));
            state.started = false;
        }
    }

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        let mut state = self.lock();
        for batch_id in removed_batch_ids {
            self.store.remove(&self.mutation_key(&state.current_user, *batch_id));
        }
        state.current_user = user.clone();
        for batch_id in added_batch_ids {
            self.persist_mutation_state(user, *batch_id, BatchState::Pending, None);
        }
    }

    fn add_pending_mutation(&self, batch_id: BatchId) {
        let user = self.lock().current_user.clone();
        self.persist_mutation_state(&user, batch_id, BatchState::Pending, None);
    }

    fn update_mutation_state(&self, batch_id: BatchId, state: BatchState, error: Option<&FirestoreError>) {
        let user = self.lock().current_user.clone();
        self.persist_mutation_state(&user, batch_id, state, error);
        // Clients read a final state from the change event, never from the
        // entry itself, so it can go right away.
        self.store.remove(&self.mutation_key(&user, batch_id));
    }

    fn add_local_query_target(&self, target_id: TargetId, add_to_active_targets: bool) -> QueryTargetState {
        let mut state = self.lock();
        let mut query_state = QueryTargetState::NotCurrent;
        if Self::all_active_targets(&state.active_clients).contains(&target_id) {
            if let Some(value) = self.store.get(&self.target_key(target_id)) {
                match serde_json::from_str::<QueryTargetEntry>(&value) {
                    Ok(entry) => query_state = entry.state,
                    Err(err) => log::warn!("failed to parse state of target {target_id}: {err}"),
                }
            }
        }
        if add_to_active_targets {
            Self::local_targets(&mut state, &self.client_id).insert(target_id);
        }
        self.persist_client_state(&state);
        query_state
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        let mut state = self.lock();
        Self::local_targets(&mut state, &self.client_id).remove(&target_id);
        self.persist_client_state(&state);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.lock()
            .active_clients
            .get(&self.client_id)
            .is_some_and(|targets| targets.contains(&target_id))
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.lock()
            .active_clients
            .values()
            .any(|targets| targets.contains(&target_id))
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        Self::all_active_targets(&self.lock().active_clients)
    }

    fn update_query_state(&self, target_id: TargetId, state: QueryTargetState, error: Option<&FirestoreError>) {
        self.write_entry(
            &self.target_key(target_id),
            &QueryTargetEntry {
                state,
                error: error.cloned(),
                update_time_ms: self.clock.now_millis(),
            },
        );
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.store.remove(&self.target_key(target_id));
    }

    fn set_online_state(&self, online_state: OnlineState) {
        self.write_entry(
            &self.online_state_key(),
            &OnlineStateEntry {
                client_id: self.client_id.clone(),
                online_state: online_state.as_str().to_string(),
            },
        );
    }

    fn subscription(&self) -> Option<SharedStoreSubscription> {
        Some(self.subscription.clone())
    }

    fn handle_store_event(&self, event: SharedStoreEvent) -> Vec<SharedClientEvent> {
        let mut state = self.lock();
        if !state.started {
            return Vec::new();
        }

        let key = event.key.as_str();
        let client_prefix = format!("{CLIENT_STATE_PREFIX}_{}_", self.persistence_key);
        let mutation_prefix = format!("{MUTATION_BATCH_PREFIX}_{}_", self.persistence_key);
        let target_prefix = format!("{QUERY_TARGET_PREFIX}_{}_", self.persistence_key);

        if let Some(client_id) = key.strip_prefix(&client_prefix) {
            if client_id == self.client_id {
                return Vec::new();
            }
            let targets = match event.new_value.as_deref().map(serde_json::from_str::<ClientStateEntry>) {
                Some(Ok(entry)) => Some(entry.active_target_ids.into_iter().collect()),
                Some(Err(err)) => {
                    log::warn!("failed to parse client state of {client_id}: {err}");
                    return Vec::new();
                }
                None => None,
            };
            return self
                .handle_client_state_event(&mut state, client_id, targets)
                .into_iter()
                .collect();
        }

        if let Some(rest) = key.strip_prefix(&mutation_prefix) {
            let Some(value) = event.new_value.as_deref() else {
                return Vec::new();
            };
            let (batch_id, uid) = match rest.split_once('_') {
                Some((batch_id, uid)) => (batch_id, Some(uid)),
                None => (rest, None),
            };
            let Ok(batch_id) = batch_id.parse::<BatchId>() else {
                return Vec::new();
            };
            if uid != state.current_user.uid() {
                log::debug!("ignoring mutation {batch_id} of inactive user {uid:?}");
                return Vec::new();
            }
            return match serde_json::from_str::<MutationEntry>(value) {
                Ok(entry) => vec![SharedClientEvent::BatchState {
                    batch_id,
                    state: entry.state,
                    error: entry.error,
                }],
                Err(err) => {
                    log::warn!("failed to parse state of batch {batch_id}: {err}");
                    Vec::new()
                }
            };
        }

        if let Some(target_id) = key.strip_prefix(&target_prefix) {
            let (Ok(target_id), Some(value)) = (target_id.parse::<TargetId>(), event.new_value.as_deref()) else {
                return Vec::new();
            };
            return match serde_json::from_str::<QueryTargetEntry>(value) {
                Ok(entry) => vec![SharedClientEvent::TargetState {
                    target_id,
                    state: entry.state,
                    error: entry.error,
                }],
                Err(err) => {
                    log::warn!("failed to parse state of target {target_id}: {err}");
                    Vec::new()
                }
            };
        }

        if key == self.online_state_key() {
            if let Some(value) = event.new_value.as_deref() {
                return self.handle_online_state_value(&state, value).into_iter().collect();
            }
        }
        Vec::new()
    }

    fn poll_events(&self) -> Vec<SharedClientEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.subscription.try_next() {
            events.extend(self.handle_store_event(event));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::permission_denied;
    use crate::firestore::local::shared_store::InMemorySharedStore;
    use crate::util::clock::ManualClock;

    fn pair() -> (StoreSharedClientState, StoreSharedClientState) {
        let area = InMemorySharedStore::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let first = StoreSharedClientState::new(
            Arc::new(area.connect()),
            "chat.(default)",
            "first",
            User::unauthenticated(),
            clock.clone(),
        );
        let second = StoreSharedClientState::new(
            Arc::new(area.connect()),
            "chat.(default)",
            "second",
            User::unauthenticated(),
            clock,
        );
        let clients = vec!["first".to_string(), "second".to_string()];
        first.start(&clients);
        second.start(&clients);
        (first, second)
    }

    #[test]
    fn targets_of_other_clients_count_as_active() {
        let (first, second) = pair();
        first.poll_events();
        second.add_local_query_target(2, true);
        assert_eq!(
            first.poll_events(),
            vec![SharedClientEvent::ActiveTargetsChange {
                added: vec![2],
                removed: vec![],
            }]
        );
        assert!(first.is_active_query_target(2));
        assert!(!first.is_local_query_target(2));

        second.remove_local_query_target(2);
        assert_eq!(
            first.poll_events(),
            vec![SharedClientEvent::ActiveTargetsChange {
                added: vec![],
                removed: vec![2],
            }]
        );
    }

    #[test]
    fn shutdown_releases_the_client_targets() {
        let (first, second) = pair();
        second.add_local_query_target(4, true);
        first.poll_events();
        second.shutdown();
        assert_eq!(
            first.poll_events(),
            vec![SharedClientEvent::ActiveTargetsChange {
                added: vec![],
                removed: vec![4],
            }]
        );
    }

    #[test]
    fn mutation_results_reach_other_clients() {
        let (first, second) = pair();
        second.poll_events();
        first.add_pending_mutation(1);
        first.update_mutation_state(1, BatchState::Rejected, Some(&permission_denied("denied")));
        assert_eq!(
            second.poll_events(),
            vec![
                SharedClientEvent::BatchState {
                    batch_id: 1,
                    state: BatchState::Pending,
                    error: None,
                },
                SharedClientEvent::BatchState {
                    batch_id: 1,
                    state: BatchState::Rejected,
                    error: Some(permission_denied("denied")),
                },
            ]
        );
    }

    #[test]
    fn mutations_of_other_users_are_ignored() {
        let (first, second) = pair();
        second.poll_events();
        first.handle_user_change(&User::new("alice"), &[], &[]);
        first.add_pending_mutation(3);
        assert!(second.poll_events().is_empty());
    }

    #[test]
    fn query_state_is_read_when_joining_an_active_target() {
        let (first, second) = pair();
        first.add_local_query_target(2, true);
        first.update_query_state(2, QueryTargetState::Current, None);
        second.poll_events();
        assert_eq!(second.add_local_query_target(2, true), QueryTargetState::Current);
        assert_eq!(second.add_local_query_target(6, true), QueryTargetState::NotCurrent);
    }

    #[test]
    fn online_state_is_shared() {
        let (first, second) = pair();
        second.poll_events();
        first.set_online_state(OnlineState::Online);
        assert_eq!(
            second.poll_events(),
            vec![SharedClientEvent::OnlineState(OnlineState::Online)]
        );
    }

    #[test]
    fn memory_state_tracks_local_targets_only() {
        let state = MemorySharedClientState::new();
        assert_eq!(state.add_local_query_target(2, true), QueryTargetState::NotCurrent);
        state.update_query_state(2, QueryTargetState::Current, None);
        assert_eq!(state.add_local_query_target(2, true), QueryTargetState::Current);
        assert!(state.is_active_query_target(2));
        state.remove_local_query_target(2);
        assert!(state.get_all_active_query_targets().is_empty());
        assert!(state.poll_events().is_empty());
    }
}
