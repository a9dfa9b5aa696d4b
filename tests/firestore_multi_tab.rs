use std::sync::Arc;
use std::time::Duration;

use firestore_sync::firestore::core::{ListenOptions, ViewSnapshot};
use firestore_sync::firestore::local::{InMemorySharedStore, Persistence, SharedStore};
use firestore_sync::firestore::model::{
    DatabaseId, DocumentKey, FieldPath, MutableDocument, Mutation, MutationResult, ResourcePath,
    SnapshotVersion,
};
use firestore_sync::firestore::remote::{
    DocumentChange, InMemoryDatastore, TargetChangeState, WatchChange, WatchRequest,
    WatchTargetChange, WriteRequest, WriteResponse,
};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_sync::firestore::{
    FirestoreClient, FirestoreErrorCode, FirestoreResult, FirestoreSettings, Query,
};
use firestore_sync::util::clock::ManualClock;

const TIMEOUT: Duration = Duration::from_secs(5);

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

fn version(micros: i64) -> SnapshotVersion {
    SnapshotVersion::from_micros(micros)
}

/// Storage every tab of one "browser" shares.
struct Browser {
    persistence: Arc<Persistence>,
    shared_store: InMemorySharedStore,
    datastore: InMemoryDatastore,
    clock: ManualClock,
}

impl Browser {
    fn new() -> Self {
        Self {
            persistence: Persistence::memory(),
            shared_store: InMemorySharedStore::new(),
            datastore: InMemoryDatastore::new(),
            clock: ManualClock::new(1_000),
        }
    }

    async fn open_tab(&self, synchronize_tabs: bool) -> FirestoreResult<FirestoreClient> {
        FirestoreClient::with_persistence(
            DatabaseId::default_database("multi-tab"),
            FirestoreSettings::default().with_synchronize_tabs(synchronize_tabs),
            self.persistence.clone(),
            Arc::new(self.datastore.clone()),
            Arc::new(self.shared_store.connect()),
            Arc::new(self.clock.clone()),
        )
        .await
    }
}

#[tokio::test]
async fn only_one_tab_is_primary() {
    let browser = Browser::new();
    let first = browser.open_tab(true).await.unwrap();
    let second = browser.open_tab(true).await.unwrap();
    assert!(first.is_primary());
    assert!(!second.is_primary());

    // The primary's lease is fresh, so a heartbeat changes nothing.
    assert!(!second.refresh_primary_lease().await.unwrap());
    assert!(first.refresh_primary_lease().await.unwrap());

    let clients = browser
        .shared_store
        .keys_with_prefix("firestore_clients_multi-tab.(default)_");
    assert_eq!(clients.len(), 2);
}

#[tokio::test]
async fn exclusive_clients_refuse_to_share_persistence() {
    let browser = Browser::new();
    let _first = browser.open_tab(true).await.unwrap();
    let error = browser.open_tab(false).await.err().unwrap();
    assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
}

#[tokio::test]
async fn secondary_takes_over_when_the_primary_shuts_down() {
    let browser = Browser::new();
    let first = browser.open_tab(true).await.unwrap();
    let second = browser.open_tab(true).await.unwrap();

    first.shutdown().await.unwrap();
    assert!(second.refresh_primary_lease().await.unwrap());
    assert!(second.is_primary());
}

#[tokio::test]
async fn stale_leases_can_be_taken_over() {
    let browser = Browser::new();
    let first = browser.open_tab(true).await.unwrap();
    let second = browser.open_tab(true).await.unwrap();

    // The primary stops refreshing; its lease ages out.
    browser.clock.advance_millis(60_000);
    assert!(second.refresh_primary_lease().await.unwrap());
    assert!(!first.refresh_primary_lease().await.unwrap());
    assert!(!first.is_primary());
}

#[tokio::test]
async fn secondary_writes_are_sent_by_the_primary() {
    let browser = Browser::new();
    let _primary = browser.open_tab(true).await.unwrap();
    let secondary = browser.open_tab(true).await.unwrap();

    let completion = secondary
        .write(vec![Mutation::set(key("rooms/a"), data(1))])
        .await
        .unwrap();

    let server = tokio::time::timeout(TIMEOUT, browser.datastore.accept_write())
        .await
        .unwrap()
        .unwrap();
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
    server
        .send(WriteResponse::Mutations {
            stream_token: b"s2".to_vec(),
            commit_version: version(5),
            mutation_results: vec![MutationResult::new(version(5))],
        })
        .unwrap();

    tokio::time::timeout(TIMEOUT, completion.wait())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn secondary_listens_are_served_through_the_primary() {
    let browser = Browser::new();
    let _primary = browser.open_tab(true).await.unwrap();
    let secondary = browser.open_tab(true).await.unwrap();

    let (sender, snapshots) = async_channel::unbounded::<FirestoreResult<ViewSnapshot>>();
    secondary
        .listen(
            rooms(),
            ListenOptions::default(),
            Arc::new(move |result| {
                let _ = sender.try_send(result);
            }),
        )
        .await
        .unwrap();

    let server = tokio::time::timeout(TIMEOUT, browser.datastore.accept_watch())
        .await
        .unwrap()
        .unwrap();
    let listen = loop {
        match tokio::time::timeout(TIMEOUT, server.next_request()).await.unwrap() {
            Some(WatchRequest::Listen(listen)) => break listen,
            Some(_) => continue,
            None => panic!("watch stream closed"),
        }
    };
    let target_id = listen.target_id;
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
            key: key("rooms/a"),
            document: Some(MutableDocument::new_found(key("rooms/a"), version(10), data(1))),
        }))
        .unwrap();
    server
        .send(WatchChange::Target(
            WatchTargetChange::new(TargetChangeState::Current, vec![target_id])
                .with_resume_token(b"t1".to_vec()),
        ))
        .unwrap();
    server
        .send(WatchChange::Target(WatchTargetChange::global_snapshot(
            version(10),
            b"t1".to_vec(),
        )))
        .unwrap();

    let synced = loop {
        let snapshot = tokio::time::timeout(TIMEOUT, snapshots.recv())
            .await
            .expect("timed out waiting for a snapshot")
            .unwrap()
            .unwrap();
        if !snapshot.from_cache {
            break snapshot;
        }
    };
    assert_eq!(synced.docs.len(), 1);
    assert!(synced.docs.get(&key("rooms/a")).is_some());
}
