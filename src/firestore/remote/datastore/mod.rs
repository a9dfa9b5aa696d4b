use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::core::Target;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{TargetData, TargetId, TargetPurpose};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::watch_change::WatchChange;

pub mod in_memory;

pub use in_memory::{InMemoryDatastore, WatchServerStream, WriteServerStream};

/// Asks the backend to start sending changes for a target.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenRequest {
    pub target_id: TargetId,
    pub target: Target,
    pub purpose: TargetPurpose,
    /// Resume from this token. Empty for a fresh listen.
    pub resume_token: Vec<u8>,
    /// Resume from this version when there is no token.
    pub read_time: SnapshotVersion,
    /// Documents the client believes match, so the backend can send an
    /// existence filter when it disagrees.
    pub expected_count: Option<i32>,
}

impl ListenRequest {
    pub fn from_target_data(target_data: &TargetData) -> Self {
        Self {
            target_id: target_data.target_id,
            target: target_data.target.clone(),
            purpose: target_data.purpose,
            resume_token: target_data.resume_token.clone(),
            read_time: if target_data.resume_token.is_empty() {
                target_data.snapshot_version
            } else {
                SnapshotVersion::none()
            },
            expected_count: target_data.expected_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchRequest {
    Listen(ListenRequest),
    Unlisten(TargetId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    /// First message of every write stream.
    Handshake,
    Mutations {
        stream_token: Vec<u8>,
        mutations: Vec<Mutation>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteResponse {
    Handshake {
        stream_token: Vec<u8>,
    },
    /// Acknowledges the oldest unacknowledged batch.
    Mutations {
        stream_token: Vec<u8>,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
    },
}

/// Client end of a bidirectional stream. Closing either end ends the stream
/// for both.
#[derive(Debug)]
pub struct StreamHandle<Req, Resp> {
    requests: Sender<Req>,
    responses: Receiver<FirestoreResult<Resp>>,
}

impl<Req, Resp> Clone for StreamHandle<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            responses: self.responses.clone(),
        }
    }
}

impl<Req, Resp> StreamHandle<Req, Resp> {
    pub fn send(&self, request: Req) -> FirestoreResult<()> {
        self.requests
            .try_send(request)
            .map_err(|_| internal_error("stream is closed"))
    }

    /// Next response. `None` once the stream ended without an error.
    pub async fn next(&self) -> Option<FirestoreResult<Resp>> {
        self.responses.recv().await.ok()
    }

    pub fn close(&self) {
        self.requests.close();
        self.responses.close();
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

/// Backend end of a bidirectional stream.
#[derive(Debug)]
pub struct ServerStream<Req, Resp> {
    requests: Receiver<Req>,
    responses: Sender<FirestoreResult<Resp>>,
}

impl<Req, Resp> ServerStream<Req, Resp> {
    /// Next client request. `None` once the client closed the stream.
    pub async fn next_request(&self) -> Option<Req> {
        self.requests.recv().await.ok()
    }

    /// A request that already arrived, without waiting.
    pub fn try_next_request(&self) -> Option<Req> {
        self.requests.try_recv().ok()
    }

    pub fn send(&self, response: Resp) -> FirestoreResult<()> {
        self.responses
            .try_send(Ok(response))
            .map_err(|_| internal_error("stream is closed"))
    }

    /// Ends the stream with `error`.
    pub fn fail(&self, error: FirestoreError) {
        let _ = self.responses.try_send(Err(error));
        self.close();
    }

    pub fn close(&self) {
        self.requests.close();
        self.responses.close();
    }

    pub fn is_closed(&self) -> bool {
        self.responses.is_closed()
    }
}

/// Connects a client handle to a server stream.
pub fn stream_pair<Req, Resp>() -> (StreamHandle<Req, Resp>, ServerStream<Req, Resp>) {
    let (request_tx, request_rx) = async_channel::unbounded();
    let (response_tx, response_rx) = async_channel::unbounded();
    (
        StreamHandle {
            requests: request_tx,
            responses: response_rx,
        },
        ServerStream {
            requests: request_rx,
            responses: response_tx,
        },
    )
}

pub type WatchStreamHandle = StreamHandle<WatchRequest, WatchChange>;
pub type WriteStreamHandle = StreamHandle<WriteRequest, WriteResponse>;

/// The network boundary: opens the two long lived streams the client uses.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Datastore: Send + Sync + 'static {
    async fn open_watch_stream(&self) -> FirestoreResult<WatchStreamHandle>;
    async fn open_write_stream(&self) -> FirestoreResult<WriteStreamHandle>;
}
