use std::collections::BTreeSet;

use futures::FutureExt;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetId;
use crate::firestore::model::{BatchId, DocumentKey, MutationBatchResult, User};
use crate::firestore::remote::online_state::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

#[cfg(target_arch = "wasm32")]
pub type RemoteStoreFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// What the remote store reports back to the layer that owns the views.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot received on the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend refused to listen to `target_id`.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The head of the write pipeline was committed.
    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The head of the write pipeline failed permanently.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the backend last reported as matching `target_id`. Must not block
    /// on anything the remote store may be holding.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn apply_online_state_change(&self, online_state: OnlineState);

    /// Switches to `user` while both streams are stopped.
    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>>;
}
