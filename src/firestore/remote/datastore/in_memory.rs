use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{unavailable, FirestoreError, FirestoreResult};
use crate::firestore::remote::datastore::{
    stream_pair, Datastore, ServerStream, WatchRequest, WatchStreamHandle, WriteRequest,
    WriteResponse, WriteStreamHandle,
};
use crate::firestore::remote::watch_change::WatchChange;

pub type WatchServerStream = ServerStream<WatchRequest, WatchChange>;
pub type WriteServerStream = ServerStream<WriteRequest, WriteResponse>;

/// Loopback datastore: every stream the client opens is handed to whoever
/// plays the backend through `accept_watch` / `accept_write`.
#[derive(Clone)]
pub struct InMemoryDatastore {
    inner: Arc<InMemoryDatastoreInner>,
}

struct InMemoryDatastoreInner {
    watch_tx: Sender<WatchServerStream>,
    watch_rx: Receiver<WatchServerStream>,
    write_tx: Sender<WriteServerStream>,
    write_rx: Receiver<WriteServerStream>,
    failures: Mutex<VecDeque<FirestoreError>>,
}

impl Default for InMemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        let (watch_tx, watch_rx) = async_channel::unbounded();
        let (write_tx, write_rx) = async_channel::unbounded();
        Self {
            inner: Arc::new(InMemoryDatastoreInner {
                watch_tx,
                watch_rx,
                write_tx,
                write_rx,
                failures: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Waits for the client to open its next watch stream.
    pub async fn accept_watch(&self) -> FirestoreResult<WatchServerStream> {
        self.inner
            .watch_rx
            .recv()
            .await
            .map_err(|_| unavailable("datastore closed"))
    }

    /// Waits for the client to open its next write stream.
    pub async fn accept_write(&self) -> FirestoreResult<WriteServerStream> {
        self.inner
            .write_rx
            .recv()
            .await
            .map_err(|_| unavailable("datastore closed"))
    }

    /// Makes the next stream open attempt, of either kind, fail with `error`.
    pub fn fail_next_open(&self, error: FirestoreError) {
        self.lock_failures().push_back(error);
    }

    fn take_failure(&self) -> Option<FirestoreError> {
        self.lock_failures().pop_front()
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, VecDeque<FirestoreError>> {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Datastore for InMemoryDatastore {
    async fn open_watch_stream(&self) -> FirestoreResult<WatchStreamHandle> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let (client, server) = stream_pair();
        self.inner
            .watch_tx
            .try_send(server)
            .map_err(|_| unavailable("datastore closed"))?;
        Ok(client)
    }

    async fn open_write_stream(&self) -> FirestoreResult<WriteStreamHandle> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let (client, server) = stream_pair();
        self.inner
            .write_tx
            .try_send(server)
            .map_err(|_| unavailable("datastore closed"))?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opened_streams_reach_the_server() {
        let datastore = InMemoryDatastore::new();
        let client = datastore.open_watch_stream().await.unwrap();
        let server = datastore.accept_watch().await.unwrap();
        client.send(WatchRequest::Unlisten(2)).unwrap();
        assert_eq!(server.next_request().await, Some(WatchRequest::Unlisten(2)));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let datastore = InMemoryDatastore::new();
        datastore.fail_next_open(unavailable("offline"));
        let err = datastore.open_write_stream().await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/unavailable");
        assert!(datastore.open_write_stream().await.is_ok());
    }
}
