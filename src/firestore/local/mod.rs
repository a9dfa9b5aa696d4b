pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_store;
pub mod mutation_queue;
pub mod persistence;
pub mod primary_lease;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod shared_client_state;
pub mod shared_store;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use local_documents_view::{DocumentMap, LocalDocumentsView};
#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
#[doc(inline)]
pub use persistence::{
    ignore_if_primary_lease_loss, FileStorageBackend, MemoryStorageBackend, PersistedState, Persistence, StorageBackend,
    TransactionMode, PRIMARY_LEASE_LOST_ERROR_MSG,
};
#[doc(inline)]
pub use primary_lease::{ClientMetadata, PrimaryLease, PrimaryLeaseManager, PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG};
#[doc(inline)]
pub use query_engine::{QueryEngine, QueryStrategy};
#[doc(inline)]
pub use reference_set::ReferenceSet;
#[doc(inline)]
pub use shared_client_state::{
    BatchState, MemorySharedClientState, QueryTargetState, SharedClientEvent, SharedClientState,
    StoreSharedClientState,
};
#[doc(inline)]
pub use shared_store::{InMemorySharedStore, SharedStore, SharedStoreEvent, SharedStoreSubscription};
#[doc(inline)]
pub use target_data::{ListenSequenceNumber, TargetData, TargetId, TargetPurpose, INVALID_SEQUENCE_NUMBER};
