use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::{select, Either};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::firestore::core::event_manager::{EventManager, ListenOptions, ListenerCallback, QueryListener};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, WriteCompletion};
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{failed_precondition, unavailable, FirestoreResult};
use crate::firestore::local::{
    LocalStore, MemorySharedClientState, Persistence, PrimaryLeaseManager, SharedClientState,
    SharedStore, SharedStoreSubscription, StoreSharedClientState,
};
use crate::firestore::model::{DatabaseId, DocumentKey, FieldIndex, MutableDocument, Mutation, User};
use crate::firestore::remote::{Datastore, OnlineState, RemoteStore, TargetChange};
use crate::firestore::settings::FirestoreSettings;
use crate::platform::runtime::{sleep, spawn_detached};
use crate::util::clock::Clock;

const CLIENT_ID_LENGTH: usize = 20;

/// One client of a database: the local cache, the sync engine and, while this
/// client holds the primary lease, the connection to the backend.
///
/// Clients opened over the same persistence and shared store coordinate
/// through them. Only the primary talks to the backend; the others send their
/// writes and listens through it.
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    database_id: DatabaseId,
    client_id: String,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    shared_client_state: Arc<dyn SharedClientState>,
    lease: PrimaryLeaseManager,
    terminated: AtomicBool,
    shutdown_signal: Sender<()>,
}

impl FirestoreClient {
    /// Opens a client over the persistence named in `settings`.
    pub async fn new(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        datastore: Arc<dyn Datastore>,
        shared_store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> FirestoreResult<Self> {
        let persistence = Persistence::open(settings.persistence());
        Self::with_persistence(database_id, settings, persistence, datastore, shared_store, clock).await
    }

    /// Opens a client over an already opened persistence. Clients sharing one
    /// `Persistence` behave like tabs sharing a browser's storage.
    pub async fn with_persistence(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        persistence: Arc<Persistence>,
        datastore: Arc<dyn Datastore>,
        shared_store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> FirestoreResult<Self> {
        let client_id = generate_client_id();
        let user = User::unauthenticated();
        log::debug!(
            "starting client {client_id} for {} (tab synchronization: {})",
            database_id.persistence_key(),
            settings.synchronize_tabs()
        );

        let lease = PrimaryLeaseManager::new(
            persistence.clone(),
            client_id.clone(),
            clock.clone(),
            settings.max_primary_lease_age(),
            settings.synchronize_tabs(),
            settings.force_ownership(),
        );
        let is_primary = lease.start()?;

        let local_store = Arc::new(LocalStore::new(
            persistence,
            user.clone(),
            settings.synchronize_tabs().then(|| client_id.clone()),
        ));
        local_store.start()?;

        let shared_client_state: Arc<dyn SharedClientState> = if settings.synchronize_tabs() {
            Arc::new(StoreSharedClientState::new(
                shared_store,
                database_id.persistence_key(),
                client_id.clone(),
                user.clone(),
                clock,
            ))
        } else {
            Arc::new(MemorySharedClientState::new())
        };

        let remote_store = RemoteStore::new(
            database_id.clone(),
            datastore,
            local_store.clone(),
            settings.backoff(),
        );
        let sync_engine = SyncEngine::new(
            local_store.clone(),
            remote_store.clone(),
            shared_client_state.clone(),
            user,
            settings.max_concurrent_limbo_resolutions(),
        );
        let event_manager = EventManager::new(sync_engine.clone());

        shared_client_state.start(&lease.active_clients()?);
        sync_engine.apply_primary_state(is_primary).await?;

        let (shutdown_signal, shutdown) = async_channel::bounded(1);
        let inner = Arc::new(ClientInner {
            database_id,
            client_id,
            local_store,
            remote_store,
            sync_engine,
            event_manager,
            shared_client_state: shared_client_state.clone(),
            lease,
            terminated: AtomicBool::new(false),
            shutdown_signal,
        });

        spawn_detached(run_lease_heartbeat(
            Arc::downgrade(&inner),
            settings.lease_refresh_interval(),
            shutdown.clone(),
        ));
        if let Some(subscription) = shared_client_state.subscription() {
            spawn_detached(run_shared_event_pump(Arc::downgrade(&inner), subscription, shutdown));
        }

        Ok(Self { inner })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn is_primary(&self) -> bool {
        self.inner.sync_engine.is_primary_client()
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.event_manager.online_state()
    }

    /// Starts delivering snapshots of `query` to `callback` until the returned
    /// registration is removed. Errors are delivered to the callback as well.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        callback: ListenerCallback,
    ) -> FirestoreResult<ListenerRegistration> {
        self.inner.verify_not_terminated()?;
        let listener = QueryListener::new(query, options, callback);
        self.inner.event_manager.listen(listener.clone()).await;
        Ok(ListenerRegistration {
            event_manager: Arc::downgrade(&self.inner.event_manager),
            listener,
        })
    }

    /// Applies `mutations` to the local cache right away. The returned
    /// completion resolves once the backend accepted or rejected them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        self.inner.verify_not_terminated()?;
        self.inner.sync_engine.write(mutations).await
    }

    /// The cached document, `None` if the cache knows it does not exist.
    pub fn get_document_from_cache(&self, key: &DocumentKey) -> FirestoreResult<Option<MutableDocument>> {
        self.inner.verify_not_terminated()?;
        let document = self.inner.local_store.read_document(key)?;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(
                "Failed to get document from cache. (However, this document may exist on the server. Run again without setting 'source' in the GetOptions to attempt to retrieve the document from the server.)",
            ))
        }
    }

    /// Runs `query` against the local cache only.
    pub fn get_documents_from_local_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        self.inner.verify_not_terminated()?;
        let query_result = self.inner.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let synthesized =
            TargetChange::create_synthesized_target_change_for_current_change(false, Vec::new());
        Ok(view
            .apply_changes(doc_changes, false, Some(&synthesized), false)
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot()))
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.verify_not_terminated()?;
        self.inner.lease.set_network_enabled(true);
        self.inner.remote_store.enable_network().await
    }

    /// Stops talking to the backend. Writes keep queueing and listeners get
    /// cached results until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.verify_not_terminated()?;
        self.inner.lease.set_network_enabled(false);
        self.inner.remote_store.disable_network().await
    }

    /// Switches the mutation queue and listens to `user`.
    pub async fn set_user(&self, user: User) -> FirestoreResult<()> {
        self.inner.verify_not_terminated()?;
        self.inner.remote_store.handle_credential_change(user).await
    }

    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.inner.verify_not_terminated()?;
        self.inner.local_store.configure_field_indexes(indexes)
    }

    /// Resolves once every write issued so far reached the backend.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.inner.verify_not_terminated()?;
        self.inner.sync_engine.wait_for_pending_writes().await
    }

    /// Runs one lease heartbeat right away instead of waiting for the next tick.
    pub async fn refresh_primary_lease(&self) -> FirestoreResult<bool> {
        self.inner.verify_not_terminated()?;
        self.inner.refresh_lease().await
    }

    /// Stops the background tasks and the streams, and hands the primary lease
    /// to whoever asks next. Later calls fail.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("shutting down client {}", self.inner.client_id);
        self.inner.shutdown_signal.close();
        self.inner.remote_store.shutdown().await;
        self.inner.shared_client_state.shutdown();
        self.inner.lease.release()
    }
}

impl ClientInner {
    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(failed_precondition("The client has already been terminated."));
        }
        Ok(())
    }

    async fn refresh_lease(&self) -> FirestoreResult<bool> {
        let is_primary = match self.lease.try_acquire_or_extend() {
            Ok(is_primary) => is_primary,
            Err(err) => {
                log::warn!("failed to refresh the primary lease: {err}");
                false
            }
        };
        if is_primary != self.sync_engine.is_primary_client() {
            self.sync_engine.apply_primary_state(is_primary).await?;
        }
        Ok(is_primary)
    }
}

/// Handle to an active listen. Dropping it does not stop the listen.
pub struct ListenerRegistration {
    event_manager: Weak<EventManager>,
    listener: Arc<QueryListener>,
}

impl ListenerRegistration {
    pub fn query(&self) -> &Query {
        self.listener.query()
    }

    pub async fn remove(self) -> FirestoreResult<()> {
        match self.event_manager.upgrade() {
            Some(event_manager) => event_manager.unlisten(&self.listener).await,
            None => Ok(()),
        }
    }
}

fn generate_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_LENGTH)
        .map(char::from)
        .collect()
}

async fn run_lease_heartbeat(inner: Weak<ClientInner>, interval: Duration, shutdown: Receiver<()>) {
    loop {
        let stop = Box::pin(shutdown.recv());
        let tick = Box::pin(sleep(interval));
        if let Either::Left(_) = select(stop, tick).await {
            break;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(err) = inner.refresh_lease().await {
            log::warn!("failed to apply primary state: {err}");
        }
    }
}

async fn run_shared_event_pump(
    inner: Weak<ClientInner>,
    subscription: SharedStoreSubscription,
    shutdown: Receiver<()>,
) {
    loop {
        let stop = Box::pin(shutdown.recv());
        let next = Box::pin(subscription.next());
        let event = match select(stop, next).await {
            Either::Left(_) | Either::Right((None, _)) => break,
            Either::Right((Some(event), _)) => event,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        for event in inner.shared_client_state.handle_store_event(event) {
            if let Err(err) = inner.sync_engine.apply_shared_client_event(event).await {
                log::warn!("failed to apply event from another client: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::local::InMemorySharedStore;
    use crate::firestore::model::{FieldPath, ResourcePath};
    use crate::firestore::remote::InMemoryDatastore;
    use crate::firestore::value::{FirestoreValue, MapValue};
    use crate::util::clock::ManualClock;

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

    fn rooms() -> Query {
        Query::collection(ResourcePath::from_string("rooms").unwrap())
    }

    async fn client() -> FirestoreClient {
        FirestoreClient::new(
            DatabaseId::default_database("test"),
            FirestoreSettings::default(),
            Arc::new(InMemoryDatastore::new()),
            Arc::new(InMemorySharedStore::new()),
            Arc::new(ManualClock::new(1_000)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn a_lone_client_becomes_primary() {
        let client = client().await;
        assert!(client.is_primary());
        assert_eq!(client.client_id().len(), CLIENT_ID_LENGTH);
        assert!(!client.client_id().contains('_'));
    }

    #[tokio::test]
    async fn local_writes_are_visible_in_the_cache() {
        let client = client().await;
        client.disable_network().await.unwrap();
        client
            .write(vec![Mutation::set(key("rooms/a"), data(1))])
            .await
            .unwrap();

        let document = client.get_document_from_cache(&key("rooms/a")).unwrap().unwrap();
        assert!(document.has_local_mutations());

        let snapshot = client.get_documents_from_local_cache(&rooms()).unwrap();
        assert_eq!(snapshot.docs.len(), 1);
        assert!(snapshot.from_cache);
        assert!(snapshot.has_pending_writes());

        let error = client.get_document_from_cache(&key("rooms/b")).unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn listeners_see_local_writes() {
        let client = client().await;
        client.disable_network().await.unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let registration = client
            .listen(
                rooms(),
                ListenOptions::default(),
                Arc::new(move |result| sink.lock().unwrap().push(result)),
            )
            .await
            .unwrap();

        client
            .write(vec![Mutation::set(key("rooms/a"), data(1))])
            .await
            .unwrap();

        let last = received.lock().unwrap().last().cloned().unwrap().unwrap();
        assert_eq!(last.docs.len(), 1);
        assert!(last.has_pending_writes());
        registration.remove().await.unwrap();
    }

    #[tokio::test]
    async fn operations_fail_after_shutdown() {
        let client = client().await;
        client.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
        let error = client.write(Vec::new()).await.err().unwrap();
        assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
    }
}
